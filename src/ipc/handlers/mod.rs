pub mod assignments;
pub mod classes;
pub mod core;
pub mod grades;
pub mod scores;
pub mod students;
pub mod weights;
