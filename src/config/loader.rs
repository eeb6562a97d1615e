//! Config loader: assembles the layered sources into a `CadenceConfig`.

use super::merge::merge_policy;
use super::sources::{environment, global_file, workspace_file};
use super::CadenceConfig;
use config::{ConfigError, File};
use std::path::Path;

pub struct ConfigLoader;

impl ConfigLoader {
    /// Load configuration for a workspace: defaults, global file, workspace files, env.
    pub fn load(workspace_root: &Path) -> Result<CadenceConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?;
        let builder = global_file::add_to_builder(builder)?;
        let builder = workspace_file::add_to_builder(builder, workspace_root)?;
        let builder = environment::add_to_builder(builder);
        builder.build()?.try_deserialize()
    }

    /// Load from one explicit file (plus defaults and env), ignoring discovery.
    pub fn load_from_file(path: &Path) -> Result<CadenceConfig, ConfigError> {
        let builder = merge_policy::builder_with_defaults()?.add_source(File::from(path));
        environment::add_to_builder(builder)
            .build()?
            .try_deserialize()
    }

    /// Render the default configuration as TOML.
    pub fn default_toml() -> Result<String, toml::ser::Error> {
        toml::to_string_pretty(&CadenceConfig::default())
    }
}
