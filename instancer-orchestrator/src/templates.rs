//! Deployment templates: per-component boot image, architecture, disks,
//! metadata and memory reservation.

use std::collections::{BTreeMap, HashMap};

use instancer_common::{Architecture, DiskClass, DiskSpec};
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("unknown component '{0}'")]
    UnknownComponent(String),
    #[error("invalid templates: {0}")]
    Invalid(String),
    #[error("reading templates: {0}")]
    Io(#[from] std::io::Error),
}

/// Memory set aside on top of the caller's request (agents, OS overhead).
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct MemoryReservation {
    #[serde(default)]
    pub fixed_mib: i64,
    #[serde(default)]
    pub percent: i64,
}

impl MemoryReservation {
    /// `None` when the reservation does not fit in an `i64`.
    pub fn reserved_for(&self, requested_mib: i64) -> Option<i64> {
        requested_mib
            .checked_mul(self.percent)
            .and_then(|scaled| self.fixed_mib.checked_add(scaled / 100))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DeploymentTemplate {
    pub boot_image: String,
    pub architecture: Architecture,
    pub boot_disk_gib: i64,
    #[serde(default)]
    pub disks: Vec<DiskSpec>,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    #[serde(default)]
    pub memory_reservation: MemoryReservation,
}

impl DeploymentTemplate {
    /// Total size of the template's extra disks of `class`.
    pub fn disk_gib(&self, class: DiskClass) -> i64 {
        self.disks
            .iter()
            .filter(|d| d.class == class)
            .map(|d| d.size_gib)
            .sum()
    }
}

/// Resolves the template for a component name.
pub trait TemplateSource: Send + Sync {
    fn resolve(&self, component: &str) -> Result<DeploymentTemplate, TemplateError>;
}

#[derive(Debug, Clone, Default)]
pub struct StaticTemplates {
    templates: HashMap<String, DeploymentTemplate>,
}

impl StaticTemplates {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, component: impl Into<String>, template: DeploymentTemplate) -> Self {
        self.templates.insert(component.into(), template);
        self
    }

    /// Parses `{ "component": DeploymentTemplate, ... }`.
    pub fn from_json(raw: &str) -> Result<Self, TemplateError> {
        let templates: HashMap<String, DeploymentTemplate> =
            serde_json::from_str(raw).map_err(|e| TemplateError::Invalid(e.to_string()))?;
        for (component, t) in &templates {
            if t.boot_image.trim().is_empty() {
                return Err(TemplateError::Invalid(format!(
                    "component '{component}' has no boot image"
                )));
            }
            if t.memory_reservation.fixed_mib < 0 || t.memory_reservation.percent < 0 {
                return Err(TemplateError::Invalid(format!(
                    "component '{component}' has a negative memory reservation"
                )));
            }
        }
        Ok(Self { templates })
    }

    pub fn from_file(path: &str) -> Result<Self, TemplateError> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_json(&raw)
    }

    pub fn components(&self) -> impl Iterator<Item = &str> {
        self.templates.keys().map(String::as_str)
    }
}

impl TemplateSource for StaticTemplates {
    fn resolve(&self, component: &str) -> Result<DeploymentTemplate, TemplateError> {
        self.templates
            .get(component)
            .cloned()
            .ok_or_else(|| TemplateError::UnknownComponent(component.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reservation_is_fixed_plus_percent() {
        let r = MemoryReservation {
            fixed_mib: 256,
            percent: 10,
        };
        assert_eq!(r.reserved_for(2048), Some(256 + 204));
        assert_eq!(MemoryReservation::default().reserved_for(4096), Some(0));
        assert_eq!(r.reserved_for(i64::MAX), None);
    }

    #[test]
    fn parses_templates_and_sums_disks() {
        let raw = r#"{
            "web": {
                "boot_image": "images/web-v3",
                "architecture": "x86_64",
                "boot_disk_gib": 20,
                "disks": [
                    {"class": "local_ssd", "size_gib": 375},
                    {"class": "local_ssd", "size_gib": 375},
                    {"class": "persistent_hdd", "size_gib": 100}
                ],
                "metadata": {"role": "web"},
                "memory_reservation": {"fixed_mib": 512}
            }
        }"#;
        let templates = StaticTemplates::from_json(raw).unwrap();
        let web = templates.resolve("web").unwrap();
        assert_eq!(web.disk_gib(DiskClass::LocalSsd), 750);
        assert_eq!(web.disk_gib(DiskClass::PersistentSsd), 0);
        assert_eq!(web.disk_gib(DiskClass::PersistentHdd), 100);
        assert_eq!(web.memory_reservation.reserved_for(1024), Some(512));
        assert!(matches!(
            templates.resolve("db"),
            Err(TemplateError::UnknownComponent(c)) if c == "db"
        ));
    }

    #[test]
    fn rejects_template_without_image() {
        let raw = r#"{"x": {"boot_image": " ", "architecture": "arm64", "boot_disk_gib": 10}}"#;
        assert!(matches!(
            StaticTemplates::from_json(raw),
            Err(TemplateError::Invalid(_))
        ));
    }
}
