//! # Coachflow Core
//!
//! Domain types, traits, and error definitions for the Coachflow automation
//! engine. This crate has **no storage or transport dependencies**; it
//! defines the model that every other crate implements against.
//!
//! ## Design Philosophy
//!
//! The two external collaborators of the engine are defined as traits here:
//! - [`Store`]: durable enrollments, tags, rules, sequences and delivery records
//! - [`MessageSender`]: delivers an email or in-app direct message
//!
//! Implementations live in `coachflow-store` and `coachflow-sender`. This keeps
//! the engine testable with in-memory stores and scripted senders.

pub mod error;
pub mod tag;
pub mod sequence;
pub mod enrollment;
pub mod rule;
pub mod delivery;
pub mod event;
pub mod store;
pub mod sender;

// Re-export key types at crate root for ergonomics
pub use error::{Error, Result, SendError, StoreError};
pub use tag::{Tag, TagSet};
pub use sequence::{Sequence, Step, StepChannel};
pub use enrollment::{Enrollment, EnrollmentStatus, EnrollmentUpdate, NewEnrollment};
pub use rule::{Predicate, RuleAction, RuleTrigger, WorkflowRule};
pub use delivery::{DeliveryOutcome, DeliveryRecord, DeliverySubject, NewDelivery};
pub use event::{AutomationEvent, Event, EventBus};
pub use store::{CreateOutcome, RecordOutcome, Store, UpdateOutcome};
pub use sender::{MessageSender, OutboundMessage, SendReceipt};
