// Configuration, format and error types for video and audio capture

pub mod capture;
pub mod audio;
