//! Agent orchestration: the per-message tool-calling loop, conversation
//! history, the action/validation recorder, and the session that wires all
//! components together.

pub mod controller;
pub mod history;
pub mod recorder;
pub mod session;

pub use controller::AgentController;
pub use history::ConversationHistory;
pub use recorder::Recorder;
pub use session::Session;
