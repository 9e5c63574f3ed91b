//! Target-ledger side of the ledger relay.
//!
//! - [`Translator`] turns a [`RelayEvent`](relay_types::RelayEvent) payload
//!   into [`TransactionArgs`]; decoding failures are terminal.
//! - [`TargetLedger`] is the consumed write/query API of the target.
//! - [`Submitter`] performs one write per call and classifies the outcome,
//!   verifying ambiguous previous attempts before writing again.
//! - [`InMemoryTargetLedger`] is an upsert map with fault switches for tests
//!   and demos.

pub mod args;
pub mod error;
pub mod memory;
pub mod submitter;
pub mod target;
pub mod translator;

pub use args::{TargetReceipt, TransactionArgs};
pub use error::{ErrorClass, TargetError, TargetResult, TranslateError, TranslateResult};
pub use memory::InMemoryTargetLedger;
pub use submitter::{SubmitOutcome, Submitter};
pub use target::TargetLedger;
pub use translator::{FieldMappingTranslator, FunctionMapping, Translator};
