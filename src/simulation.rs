//! A concurrent arena: fighters duel, play team matches, draw, and leave, while several workers feed the outcomes
//! into a PvP and an arena tracker sharing one store. The numbers the trackers end up with are checked against
//! what the script is known to contain.

pub mod script;
pub mod sim_app;

pub use script::Bout;
pub use script::Fighter;
pub use script::Script;
pub use script::ScriptWriter;
pub use sim_app::ArenaApp;
pub use sim_app::ArenaReport;
pub use sim_app::TrackerSummary;
