mod config_cmd;
mod doc_cmd;
mod sync_cmd;

pub use config_cmd::ConfigCommand;
pub use doc_cmd::DocCommand;
pub use sync_cmd::SyncCommand;

use clap::ValueEnum;
use serde_json::Value;
use std::io::{self, Write};

use sitesync::Document;

#[derive(Clone, ValueEnum, Default)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Asks a yes/no question on stdin. Anything but `y` is a no.
fn confirm(question: &str) -> io::Result<bool> {
    print!("{} [y/N] ", question);
    io::stdout().flush()?;

    let mut input = String::new();
    io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case("y"))
}

/// Human label of a document: its `name`, else its `title`.
fn display_name(doc: &Document) -> &str {
    ["name", "title"]
        .iter()
        .find_map(|key| doc.get(key).and_then(Value::as_str))
        .unwrap_or("")
}
