//! Persistence layer: job repository and billing ledger on libSQL.

pub mod libsql_backend;
pub mod migrations;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use traits::{JobStore, Ledger, LedgerTransaction, RefundReceipt, TransactionKind};
