// Interface adapters: config/event protocol, stores, unit backends and id sources.

pub mod events;
pub mod protocol;
pub mod state;
pub mod units;
pub mod utils;
