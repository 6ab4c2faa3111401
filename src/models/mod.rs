mod document;
mod outbox_entry;

pub use document::{DocRef, Document, DocumentError, Identity, CORRELATION_FIELD, SERVER_ID_FIELD};
pub use outbox_entry::{Action, DeadLetter, OutboxEntry};
