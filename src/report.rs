//! Missing-modules report: what could not be found on one machine, to be looked up in a scan
//! performed somewhere else

use crate::common::ReportError;
use crate::models::{find_nodes_by_name, missing_modules, DependencyTree, NodeLocation};
use chrono::{Local, NaiveDateTime, SubsecRound};
use fs_err as fs;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MissingReport {
    #[serde(rename = "missing_dlls")]
    pub missing_modules: Vec<String>,
    /// Local time of the machine that produced the report
    pub generated_time: NaiveDateTime,
    pub target_machine: String,
}

impl MissingReport {
    pub fn from_forest(forest: &[DependencyTree]) -> Self {
        Self {
            missing_modules: missing_modules(forest),
            generated_time: Local::now().naive_local().trunc_subsecs(0),
            target_machine: host_name(),
        }
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ReportError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ReportError> {
        let content = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&content)?)
    }

    /// Every node of the forest named like one of the missing modules
    pub fn locate_in(&self, forest: &[DependencyTree]) -> Vec<NodeLocation> {
        find_nodes_by_name(forest, &self.missing_modules)
    }
}

/// For each missing module, the names of the modules importing it, without repetitions
///
/// Keys are lowercase; the importers are listed in the order they are met.
pub fn missing_by_importer(forest: &[DependencyTree]) -> BTreeMap<String, Vec<String>> {
    let mut ret: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for tree in forest {
        for (id, node) in tree.iter() {
            if !node.is_missing() {
                continue;
            }
            let importer = tree
                .parent(id)
                .map(|p| p.file_name.clone())
                .unwrap_or_default();
            let importers = ret.entry(node.file_name.to_lowercase()).or_default();
            if !importer.is_empty() && !importers.contains(&importer) {
                importers.push(importer);
            }
        }
    }
    ret
}

fn host_name() -> String {
    ["COMPUTERNAME", "HOSTNAME"]
        .iter()
        .find_map(|var| std::env::var(var).ok().filter(|s| !s.is_empty()))
        .unwrap_or_else(|| "unknown".to_owned())
}
