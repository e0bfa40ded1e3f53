//! Configuration structures and loading

mod config;

pub use config::{
    BackupConfiguration, Configuration, DockerConfiguration, HealthConfiguration,
};
