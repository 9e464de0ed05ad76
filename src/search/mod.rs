pub mod context;
pub mod prompt;

pub use context::{ContextBuilder, ContextConfig, RagCase, RagContext, RelatedBug, RelatedBugs};
pub use prompt::assemble_prompt;
