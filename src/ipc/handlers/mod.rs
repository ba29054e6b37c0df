pub mod analytics;
pub mod attendance;
pub mod core;
pub mod grades;
pub mod setup;
pub mod students;
pub mod subjects;
pub mod users;
