// OS-specific capture backends, selected at compile time and by configuration

pub mod capture;
pub mod audio;
