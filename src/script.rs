//! LSB init-script header parser.
//!
//! Reads the `### BEGIN INIT INFO` / `### END INIT INFO` block out of a
//! shell script and turns its recognised tags into a [`Service`] record.
//! Everything outside the block, and any unrecognised tag inside it, is
//! ignored.

use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error::{Error, Result};

/// The six header tags a script may declare, in the order they're scanned.
/// `Provides` always occupies element 0, `NonStop` element 1 — callers that
/// special-case either rely on this.
pub const PROPERTIES: [Property; 6] = [
    Property::Provides,
    Property::NonStop,
    Property::RequiredStart,
    Property::RequiredStop,
    Property::XStartBefore,
    Property::XStopAfter,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Property {
    Provides,
    RequiredStart,
    RequiredStop,
    XStartBefore,
    XStopAfter,
    NonStop,
}

impl Property {
    fn tag(self) -> &'static str {
        match self {
            Property::Provides => "# Provides:",
            Property::RequiredStart => "# Required-Start:",
            Property::RequiredStop => "# Required-Stop:",
            Property::XStartBefore => "# X-Start-Before:",
            Property::XStopAfter => "# X-Stop-After:",
            Property::NonStop => "# Non-Stop:",
        }
    }
}

/// A parsed init script. Immutable after load, except for `process`, which
/// the start executor fills in for `Non-Stop` services and the stop
/// executor later reads. Recorded as a bare pid rather than an owned
/// `std::process::Child`: the supervisor's background waiter thread owns
/// the `Child` for its whole lifetime, and the stop path only ever needs
/// to signal the pid, never join it.
#[derive(Debug)]
pub struct Service {
    pub script: PathBuf,
    pub properties: BTreeMap<Property, BTreeSet<String>>,
    pub process: Mutex<Option<i32>>,
}

impl Service {
    /// Parse one script file into a `Service`. The script always provides
    /// its own path, even if it has no INIT INFO block at all.
    pub fn load(script: &Path) -> Result<Service> {
        let f = std::fs::File::open(script).map_err(|source| Error::ReadScript {
            path: script.to_path_buf(),
            source,
        })?;

        let mut properties: BTreeMap<Property, BTreeSet<String>> = BTreeMap::new();
        for prop in PROPERTIES {
            properties.insert(prop, BTreeSet::new());
        }
        properties
            .get_mut(&Property::Provides)
            .unwrap()
            .insert(script.to_string_lossy().into_owned());

        let reader = BufReader::new(f);
        let mut begun = false;

        for line in reader.lines() {
            let line = line.map_err(|source| Error::ReadScript {
                path: script.to_path_buf(),
                source,
            })?;

            if !begun {
                if line.trim_end() == "### BEGIN INIT INFO" {
                    begun = true;
                }
                continue;
            }

            if line.trim_end() == "### END INIT INFO" {
                break;
            }

            if !line.starts_with("# ") {
                continue;
            }

            for prop in PROPERTIES {
                if let Some(rest) = line.strip_prefix(prop.tag()) {
                    for token in rest.split_whitespace() {
                        properties.get_mut(&prop).unwrap().insert(token.to_string());
                    }
                    break;
                }
            }
        }

        Ok(Service {
            script: script.to_path_buf(),
            properties,
            process: Mutex::new(None),
        })
    }

    /// Is this a `Non-Stop` service — one that execs a long-running program
    /// rather than accepting `start`/`stop` arguments?
    pub fn is_non_stop(&self) -> bool {
        self.properties[&Property::NonStop]
            .iter()
            .any(|v| v.eq_ignore_ascii_case("true") || v.eq_ignore_ascii_case("yes"))
    }

    pub fn provides(&self) -> &BTreeSet<String> {
        &self.properties[&Property::Provides]
    }

    pub fn edges(&self, prop: Property) -> &BTreeSet<String> {
        &self.properties[&prop]
    }

    pub fn edges_mut(&mut self, prop: Property) -> &mut BTreeSet<String> {
        self.properties.get_mut(&prop).unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::File::create(&path).unwrap();
        writeln!(f, "{body}").unwrap();
        path
    }

    #[test]
    fn parses_recognised_tags() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "s",
            "#!/bin/sh\n\
             ### BEGIN INIT INFO\n\
             # Provides:          X Y\n\
             # Required-Start:    A B\n\
             ### END INIT INFO\n\
             exit 0\n",
        );

        let srv = Service::load(&path).unwrap();
        let mut provides: BTreeSet<String> = srv.provides().clone();
        provides.remove(&path.to_string_lossy().into_owned());
        assert_eq!(provides, BTreeSet::from(["X".into(), "Y".into()]));
        assert_eq!(
            srv.edges(Property::RequiredStart).clone(),
            BTreeSet::from(["A".into(), "B".into()])
        );
    }

    #[test]
    fn missing_begin_marker_yields_empty_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(dir.path(), "s", "#!/bin/sh\nexit 0\n");

        let srv = Service::load(&path).unwrap();
        assert!(srv.edges(Property::RequiredStart).is_empty());
        assert_eq!(srv.provides().len(), 1);
    }

    #[test]
    fn ignores_unrecognised_lines_and_empty_tokens() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "s",
            "### BEGIN INIT INFO\n\
             # Short-Description: not a recognised tag\n\
             # Provides:   \n\
             not a comment at all\n\
             ### END INIT INFO\n",
        );

        let srv = Service::load(&path).unwrap();
        assert_eq!(srv.provides().len(), 1); // only the self-Provides
    }

    #[test]
    fn non_stop_is_case_insensitive() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_script(
            dir.path(),
            "s",
            "### BEGIN INIT INFO\n# Non-Stop: YES\n### END INIT INFO\n",
        );
        assert!(Service::load(&path).unwrap().is_non_stop());
    }
}
