use crate::config::{ConfigBackend, Configuration};
use anyhow::Context;
use std::path::Path;
use std::str::FromStr;
use toml_edit::DocumentMut;
use tracing::debug;

/// A parsed configuration document, before it is mapped onto [`Configuration`].
#[derive(Debug, Clone)]
pub struct TomlConfiguration {
    document: DocumentMut,
}

impl TomlConfiguration {
    fn parse(source: &str) -> anyhow::Result<Self> {
        let document = DocumentMut::from_str(source).context("Malformed TOML")?;
        Ok(Self { document })
    }

    /// Names of the top-level tables present in the document.
    fn sections(&self) -> Vec<&str> {
        self.document
            .iter()
            .filter(|(_, item)| item.is_table())
            .map(|(name, _)| name)
            .collect()
    }

    fn into_configuration(self) -> anyhow::Result<Configuration> {
        Ok(toml_edit::de::from_document(self.document)?)
    }
}

impl ConfigBackend for TomlConfiguration {
    fn load<P: AsRef<Path>>(file: P) -> anyhow::Result<Configuration> {
        let source = std::fs::read_to_string(file.as_ref())?;
        let toml = Self::parse(&source)?;
        debug!("Configuration sections: {:?}", toml.sections());
        toml.into_configuration()
    }
}
