use glob::{glob, Pattern};
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::{debug, warn};

use super::DiscoveryError;

/// Expands include globs and filters them through exclude globs.
#[derive(Debug, Clone)]
pub struct FileFinder {
    include: Vec<String>,
    exclude: Vec<Pattern>,
}

impl FileFinder {
    pub fn new(include: Vec<String>, exclude: &[String]) -> Result<Self, DiscoveryError> {
        for pattern in &include {
            Pattern::new(pattern).map_err(|e| DiscoveryError::InvalidGlob {
                pattern: pattern.clone(),
                message: e.to_string(),
            })?;
        }

        let exclude = exclude
            .iter()
            .map(|pattern| {
                Pattern::new(pattern).map_err(|e| DiscoveryError::InvalidGlob {
                    pattern: pattern.clone(),
                    message: e.to_string(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { include, exclude })
    }

    /// Regular files currently matching, in glob order, without duplicates.
    ///
    /// Unreadable directories and entries are logged and skipped so one bad
    /// path never hides the rest of the scan.
    pub fn find_files(&self) -> Vec<PathBuf> {
        let mut seen = HashSet::new();
        let mut paths = Vec::new();

        for pattern in &self.include {
            let matches = match glob(pattern) {
                Ok(matches) => matches,
                Err(e) => {
                    warn!(pattern = %pattern, error = %e, "Skipping invalid glob");
                    continue;
                }
            };

            for entry in matches {
                let path = match entry {
                    Ok(path) => path,
                    Err(e) => {
                        let err = DiscoveryError::Glob {
                            path: e.path().to_path_buf(),
                            source: e.into_error(),
                        };
                        debug!(error = %err, "Skipping unreadable path");
                        continue;
                    }
                };

                if !path.is_file() {
                    continue;
                }
                if self.exclude.iter().any(|p| p.matches_path(&path)) {
                    continue;
                }
                if seen.insert(path.clone()) {
                    paths.push(path);
                }
            }
        }

        paths
    }
}
