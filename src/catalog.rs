//! Service catalog: loads a directory of init scripts, builds the reverse
//! `providers` index, rewrites `X-Start-Before` / `X-Stop-After` into
//! `Required-Start` / `Required-Stop` edges on the other side, and rejects
//! the catalog outright if the resulting start graph has a cycle.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::script::{Property, Service};

/// Terminal and non-terminal states shared by services and the tokens they
/// provide during one execute() pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Pending,
    Waiting,
    Running,
    Success,
    Failed,
    Error,
}

impl State {
    pub fn is_terminal(self) -> bool {
        matches!(self, State::Success | State::Failed | State::Error)
    }
}

pub struct ServiceCatalog {
    pub services: HashMap<PathBuf, Service>,
    pub providers: HashMap<String, Vec<PathBuf>>,
    pub deps: HashSet<String>,
}

impl ServiceCatalog {
    /// Walk `dir` non-recursively, parsing every regular file as a script.
    /// An existing, empty directory yields an empty catalog; a directory
    /// that cannot be read (missing, permission denied, …) is a fatal load
    /// error, same as any other I/O failure below.
    pub fn load(dir: &Path) -> Result<ServiceCatalog> {
        let mut services = HashMap::new();

        let entries = std::fs::read_dir(dir).map_err(|source| Error::ReadConfDir {
            path: dir.to_path_buf(),
            source,
        })?;

        for entry in entries {
            let entry = entry.map_err(|source| Error::ReadConfDir {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|source| Error::ReadConfDir {
                path: dir.to_path_buf(),
                source,
            })?;
            if !file_type.is_file() {
                continue;
            }
            let srv = Service::load(&path)?;
            services.insert(path, srv);
        }

        let mut catalog = ServiceCatalog {
            services,
            providers: HashMap::new(),
            deps: HashSet::new(),
        };
        catalog.normalise()?;
        Ok(catalog)
    }

    fn normalise(&mut self) -> Result<()> {
        // 1. build providers index
        for srv in self.services.values() {
            for token in srv.provides() {
                self.providers
                    .entry(token.clone())
                    .or_default()
                    .push(srv.script.clone());
            }
        }

        // 2. freeze deps
        self.deps = self.providers.keys().cloned().collect();

        // 3. prune references to tokens nobody provides
        for srv in self.services.values_mut() {
            for prop in [
                Property::RequiredStart,
                Property::RequiredStop,
                Property::XStartBefore,
                Property::XStopAfter,
            ] {
                let deps = &self.deps;
                srv.edges_mut(prop).retain(|tok| deps.contains(tok));
            }
        }

        // 4. rewrite X-Start-Before / X-Stop-After into the other side's
        // Required-Start / Required-Stop, then empty the X- properties.
        self.merge_depend(Property::XStartBefore, Property::RequiredStart);
        self.merge_depend(Property::XStopAfter, Property::RequiredStop);

        // 5. fail fast on a cyclic start graph rather than let the executor
        // deadlock on it.
        self.check_acyclic()?;

        Ok(())
    }

    fn merge_depend(&mut self, from: Property, to: Property) {
        let scripts: Vec<PathBuf> = self.services.keys().cloned().collect();
        for script in scripts {
            let wants: BTreeSet<String> = self.services[&script].edges(from).clone();
            for token in wants {
                if let Some(providers) = self.providers.get(&token) {
                    for provider in providers.clone() {
                        if let Some(victim) = self.services.get_mut(&provider) {
                            victim.edges_mut(to).insert(
                                script.to_string_lossy().into_owned(),
                            );
                        }
                    }
                }
            }
            if let Some(srv) = self.services.get_mut(&script) {
                srv.edges_mut(from).clear();
            }
        }
    }

    /// Kahn's algorithm over the normalised `Required-Start` edges. A
    /// service's dependency tokens are resolved back to the scripts that
    /// provide them; any token with no provider (already pruned) or
    /// self-reference just contributes no edge.
    fn check_acyclic(&self) -> Result<()> {
        let mut indegree: HashMap<&Path, usize> = self
            .services
            .keys()
            .map(|p| (p.as_path(), 0usize))
            .collect();
        let mut edges: HashMap<&Path, Vec<&Path>> = HashMap::new();

        for srv in self.services.values() {
            for token in srv.edges(Property::RequiredStart) {
                for provider in self.providers.get(token).into_iter().flatten() {
                    edges.entry(provider.as_path()).or_default().push(&srv.script);
                    *indegree.entry(srv.script.as_path()).or_insert(0) += 1;
                }
            }
        }

        let mut ready: Vec<&Path> = indegree
            .iter()
            .filter(|(_, deg)| **deg == 0)
            .map(|(p, _)| *p)
            .collect();
        let mut visited = 0usize;

        while let Some(node) = ready.pop() {
            visited += 1;
            if let Some(successors) = edges.get(node) {
                for succ in successors {
                    let deg = indegree.get_mut(succ).unwrap();
                    *deg -= 1;
                    if *deg == 0 {
                        ready.push(succ);
                    }
                }
            }
        }

        if visited < self.services.len() {
            let offender = indegree
                .iter()
                .find(|(_, deg)| **deg > 0)
                .map(|(p, _)| p.to_path_buf())
                .unwrap_or_default();
            return Err(Error::CycleDetected(offender));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &Path, name: &str, body: &str) {
        let mut f = std::fs::File::create(dir.join(name)).unwrap();
        write!(f, "{body}").unwrap();
    }

    #[test]
    fn empty_confdir_yields_empty_catalog() {
        // An existing confdir with no scripts in it is the §8 "empty
        // confdir" boundary case: vacuous success, not an error.
        let dir = tempfile::tempdir().unwrap();
        let catalog = ServiceCatalog::load(dir.path()).unwrap();
        assert!(catalog.services.is_empty());
    }

    #[test]
    fn missing_confdir_is_a_fatal_load_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("does-not-exist");
        let err = ServiceCatalog::load(&missing).unwrap_err();
        assert!(matches!(err, Error::ReadConfDir { .. }));
    }

    #[test]
    fn x_start_before_becomes_required_start_on_target() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "net",
            "### BEGIN INIT INFO\n# Provides: net\n# X-Start-Before: app\n### END INIT INFO\n",
        );
        write_script(
            dir.path(),
            "app",
            "### BEGIN INIT INFO\n# Provides: app\n### END INIT INFO\n",
        );

        let catalog = ServiceCatalog::load(dir.path()).unwrap();
        let net_path = dir.path().join("net");
        let app_path = dir.path().join("app");

        let net = &catalog.services[&net_path];
        assert!(net.edges(Property::XStartBefore).is_empty());

        let app = &catalog.services[&app_path];
        assert!(
            app.edges(Property::RequiredStart)
                .contains(&net_path.to_string_lossy().into_owned())
        );
    }

    #[test]
    fn unknown_dependency_token_is_pruned() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "a",
            "### BEGIN INIT INFO\n# Provides: a\n# Required-Start: ghost\n### END INIT INFO\n",
        );
        let catalog = ServiceCatalog::load(dir.path()).unwrap();
        let a = &catalog.services[&dir.path().join("a")];
        assert!(a.edges(Property::RequiredStart).is_empty());
    }

    #[test]
    fn cycle_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "x",
            "### BEGIN INIT INFO\n# Provides: x\n# Required-Start: y\n### END INIT INFO\n",
        );
        write_script(
            dir.path(),
            "y",
            "### BEGIN INIT INFO\n# Provides: y\n# Required-Start: x\n### END INIT INFO\n",
        );

        let err = ServiceCatalog::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::CycleDetected(_)));
    }

    #[test]
    fn self_loop_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        write_script(
            dir.path(),
            "a",
            "### BEGIN INIT INFO\n# Provides: a\n# Required-Start: a\n### END INIT INFO\n",
        );
        // a depends on its own provided token, which can only become
        // Success once a itself has run -- an unresolvable cycle.
        let err = ServiceCatalog::load(dir.path()).unwrap_err();
        assert!(matches!(err, Error::CycleDetected(_)));
    }
}
