pub mod notify;
pub mod state;
pub mod status;
pub mod wait;

pub use notify::{NotifyAction, NotifyExitArgs};
pub use state::{StateAction, StateArgs};
pub use status::StatusArgs;
pub use wait::WaitArgs;
