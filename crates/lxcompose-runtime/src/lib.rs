//! Container lifecycle management for lxcompose.
//!
//! [`LifecycleController`](lifecycle::LifecycleController) owns the state
//! machine and persists every transition through the
//! [`StateStore`](state::StateStore). [`LogRetrieval`](logs::LogRetrieval)
//! and [`TemplateService`](template::TemplateService) work on the same data
//! directory. External programs are only ever run through an injected
//! [`CommandRunner`](command::CommandRunner).

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cancel;
pub mod command;
pub mod driver;
pub mod layout;
pub mod lifecycle;
pub mod logs;
pub mod retry;
pub mod state;
pub mod template;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use cancel::CancelToken;
pub use lifecycle::LifecycleController;
pub use logs::{LogOptions, LogRetrieval, LogStream};
pub use state::StateStore;
pub use template::TemplateService;
