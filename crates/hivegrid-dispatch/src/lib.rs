//! hivegrid-dispatch — the per-node assignment engine.
//!
//! The dispatcher asks [`AssignmentSet`] what a node needs: it computes
//! the delta of tasks plus dependency payloads (secrets, configs, the
//! materialized peer-group file, and issued certificate bundles) and
//! produces incremental [`message::AssignmentsMessage`] batches for the
//! agent. Reads happen under a caller-provided store snapshot; the
//! engine never writes to the store.

pub mod assignments;
pub mod drivers;
pub mod issuance;
pub mod message;

pub use assignments::AssignmentSet;
pub use drivers::{
    validate_secret_payload, DriverError, DriverProvider, SecretDriver, MAX_SECRET_SIZE,
};
pub use issuance::{generate_ca, issue_certificate, IssuanceError, IssuedCertificate};
pub use message::{Assignment, AssignmentAction, AssignmentChange, AssignmentsMessage};
