mod manifest;
mod payload;
mod status;
pub mod time;
mod update;
mod webhook;

pub use manifest::{
    ASSET_INTENT_CREATURE, ArtifactRecord, AssetRecord, EntityManifest, MANIFEST_VERSION,
    StatusHistoryEntry, TaskGraphEntry, TaskSubmission,
};
pub use payload::{
    AnimationPayload, ApiVersion, EntryPayload, RefinePayload, RetexturePayload, RiggingPayload,
    StagePayload, Text3dPayload,
};
pub use status::{ParseStatusError, ServiceKind, StatusSource, TaskId, TaskStatus};
pub use update::{StatusUpdate, SubmissionDisposition, UpdateDisposition};
pub use webhook::{
    WebhookBasicAnimations, WebhookModelUrls, WebhookPayload, WebhookRiggingResult,
    WebhookTaskError, WebhookTextureUrls,
};
