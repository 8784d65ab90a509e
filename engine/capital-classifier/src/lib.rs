//! Capital Source Classifier
//!
//! Assigns every managed account an ownership tier and an initial allocation from a
//! versioned, priority-ordered rule table evaluated over recorded deal evidence.
//! The classifier is the only writer of the tag/allocation pair and the only source
//! of `profit_withdrawals`.

pub mod classifier;
pub mod config;
pub mod error;
pub mod evidence;
pub mod reconcile;
pub mod rules;

pub use classifier::{CapitalClassifier, Classification, ClassificationReport, Decision, UnknownAccount};
pub use config::ClassifierConfig;
pub use error::{ClassifierError, Result};
pub use evidence::{parse_transfer, Evidence, Transfer, TransferDirection};
pub use reconcile::{ReconciliationMismatch, ReconciliationReport};
pub use rules::{Rule, RuleId, RULES, RULESET_VERSION};
