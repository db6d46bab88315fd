pub mod error;
pub mod messaging;
pub mod model;

pub use error::{ColonyError, ColonyResult};
pub use messaging::*;
pub use model::*;

pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}
