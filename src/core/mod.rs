// Backend-independent pieces: lifecycle, waiting, format conversion and the device facades

pub mod session;
pub mod wait;
pub mod convert;
pub mod drain;
pub mod config;

pub mod video_device;
pub mod audio_device;
