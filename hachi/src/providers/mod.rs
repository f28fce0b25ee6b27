//! Provider integrations.
//!
//! Concrete LLM backends live outside the core: anything that implements
//! [`ChatProvider`](crate::chat::ChatProvider) plugs into an agent. The
//! core ships only [`MockProvider`], a scripted provider used throughout
//! the test suites and handy for downstream tests.

mod mock;

pub use mock::MockProvider;
