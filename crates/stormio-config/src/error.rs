use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no profile found: checked --profile, $CLOUDIOPATH and /etc/cloudio/default.cfg")]
    ProfileNotFound,

    #[error("io error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parse error in {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}
