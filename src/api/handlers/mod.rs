pub mod attendance;
pub mod classes;
pub mod core;
pub mod evaluations;
pub mod otp;
pub mod portraits;
pub mod student_fields;
pub mod students;
pub mod teachers;
pub mod users;
