mod loader;
mod settings;
pub mod error;

pub use error::ConfigError;
pub use loader::locate_profile;
pub use settings::{
    DatabaseSettings, ExternalSettings, MetaDataSettings, ModuleOptionSettings,
    OpenstackSettings, PathSettings, ServerSettings, Settings, UsgSettings, WebAppSettings,
};
