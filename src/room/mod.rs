mod state;

pub use state::{Participant, Room};
