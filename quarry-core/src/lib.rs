pub mod assistant;
pub mod settings;

pub use assistant::{QueryAssistant, CANNOT_ANSWER_GUIDANCE, DEFAULT_AUDIT_TIMEOUT};
pub use settings::{assemble, Assembly, AuditSettings, LlmBackend, LlmSettings, Settings};
