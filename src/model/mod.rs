pub mod goal;

pub use goal::{Goal, GoalDirection};
