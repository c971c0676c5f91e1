//! Submission, persistence and webhook completion for remote generation jobs.

pub mod client;
pub mod config;
pub mod error;
pub mod factory;
pub mod progress;
pub mod repository;
pub mod services;
pub mod webhook;

#[cfg(test)]
mod test_support;

pub use client::{ClientError, Download, ProviderClient};
pub use config::{AgentConfig, ClientConfig};
pub use error::{Error, Result};
pub use factory::ServiceFactory;
pub use progress::{ProgressRegistry, ProgressSnapshot};
pub use repository::{TaskLocation, TaskRepository};
pub use services::{
    AnimationRequest, RefineRequest, RetextureRequest, RiggingRequest, StageRequest,
    SubmissionService, Text3dRequest,
};
pub use webhook::{WebhookHandler, WebhookOutcome};
