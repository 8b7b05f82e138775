pub mod errors;
pub mod events;
pub mod guidance;
pub mod history;
pub mod metadata;
pub mod species;
