//! # Stepline Engine
//!
//! Runs declarative workflows: ordered jobs made of steps, where each step is
//! a shell command, an inline Lua script or a plugin. Every node goes through
//! the same lifecycle (precheck, compile, preflight, run) and records its
//! outcome in a status tree that templates can inspect.
//!
//! ## Usage
//!
//! ```rust
//! use stepline_engine::{EngineConfig, OsEnv, PluginRegistry, RunnableContext, Workflow, parse_workflow};
//!
//! let definition = parse_workflow(r#"
//! name: hello
//! jobs:
//!   greet:
//!     steps:
//!       - name: answer
//!         script: "'answer is ' .. args.answer"
//! "#)?;
//!
//! let cache = tempfile::tempdir()?;
//! let config = EngineConfig::default().with_cache_dir(cache.path());
//! let args = indexmap::indexmap! { "answer".to_string() => "42".to_string() };
//! let mut ctx = RunnableContext::new(config, args)?;
//!
//! let mut workflow = Workflow::new(&definition, &PluginRegistry::new());
//! let result = workflow.execute(&OsEnv::shared(), &mut ctx);
//! assert_eq!(result.return_code, 0);
//! assert_eq!(result.output, "answer is 42\n");
//! # Ok::<(), anyhow::Error>(())
//! ```
//!
//! ## Architecture
//!
//! - **`template`**: `${{ expr }}` scanning, interpolation and boolean gates
//! - **`script`**: sandboxed Lua context with a compile cache
//! - **`status`**: arena of pass/fail/skip nodes with continue-on-error rules
//! - **`plugin`**: plugin references, registry and the versioned plugin cache
//! - **`runnable`**: workflow, job, step and runner lifecycle
//! - **`loader`**: workflow documents and env-file merging

pub mod config;
pub mod error;
pub mod loader;
pub mod plugin;
pub mod runnable;
pub mod script;
pub mod status;
pub mod template;

pub use config::EngineConfig;
pub use error::{AGGREGATE_FAILURE_CODE, MultiError, join_errors};
pub use loader::{load_workflow_file, parse_workflow};
pub use plugin::{Plugin, PluginError, PluginManager, PluginMetadata, PluginRef, PluginRegistry, PluginSource};
pub use runnable::{Job, Runnable, RunnableContext, RunnableResult, Runner, Step, Workflow};
pub use script::{ScriptContext, ScriptError, Variables};
pub use status::{RunnableStatus, RunnableType, Status, StatusId, StatusTree};
pub use stepline_util::{Env, OsEnv, ScopedEnv, SharedEnv};
pub use template::{Token, TokenKind, scan_tokens};
