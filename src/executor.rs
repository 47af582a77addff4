//! Dependency executor: drives the start and stop phases. Both share the
//! same schedule-pass / completion-channel shape; they differ only in
//! which edge property gates readiness and what "ready" means for that
//! property.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::{Arc, Mutex};

use threadpool::ThreadPool;

use crate::catalog::{ServiceCatalog, State};
use crate::script::Property;
use crate::supervisor::Supervisor;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Start,
    Stop,
}

impl Phase {
    fn edge_property(self) -> Property {
        match self {
            Phase::Start => Property::RequiredStart,
            Phase::Stop => Property::RequiredStop,
        }
    }
}

struct RunState {
    service_state: HashMap<PathBuf, State>,
    dep_state: HashMap<String, State>,
}

impl RunState {
    fn init(catalog: &ServiceCatalog) -> RunState {
        RunState {
            service_state: catalog
                .services
                .keys()
                .map(|p| (p.clone(), State::Pending))
                .collect(),
            dep_state: catalog
                .deps
                .iter()
                .map(|d| (d.clone(), State::Pending))
                .collect(),
        }
    }
}

struct ExecuteResult {
    script: PathBuf,
    state: State,
}

pub struct Executor {
    catalog: Arc<ServiceCatalog>,
    phase: Phase,
    supervisor: Arc<Supervisor>,
}

impl Executor {
    pub fn new(catalog: Arc<ServiceCatalog>, phase: Phase, supervisor: Arc<Supervisor>) -> Executor {
        Executor {
            catalog,
            phase,
            supervisor,
        }
    }

    /// Run every service through this phase, respecting the partial order.
    /// Returns true iff every service finished Success (start phase only;
    /// the stop phase's return carries no meaning and is ignored by
    /// convention, matching a best-effort shutdown).
    pub fn execute(&self) -> bool {
        let state = Mutex::new(RunState::init(&self.catalog));
        let (tx, rx) = mpsc::channel::<ExecuteResult>();
        let pool_size = self.catalog.services.len().max(1);
        let pool = ThreadPool::new(pool_size);

        let (mut have_runnable, mut have_error) = self.schedule_pass(&state, &tx, &pool);

        while have_runnable {
            let Ok(result) = rx.recv() else { break };
            self.apply_result(&state, result);
            while let Ok(result) = rx.try_recv() {
                self.apply_result(&state, result);
            }
            let (hr, he) = self.schedule_pass(&state, &tx, &pool);
            have_runnable = hr;
            have_error = he;
        }

        match self.phase {
            Phase::Start => !have_error,
            Phase::Stop => false,
        }
    }

    /// One schedule pass: promote every Pending service whose dependencies
    /// are resolved to Running and dispatch it, and report whether any
    /// service is still unsettled and whether any has already failed.
    fn schedule_pass(
        &self,
        state: &Mutex<RunState>,
        tx: &mpsc::Sender<ExecuteResult>,
        pool: &ThreadPool,
    ) -> (bool, bool) {
        let mut have_runnable = false;
        let mut have_error = false;
        let mut to_dispatch = Vec::new();

        {
            let mut st = state.lock().unwrap();
            let paths: Vec<PathBuf> = st.service_state.keys().cloned().collect();

            for path in paths {
                let mut s = st.service_state[&path];
                match s {
                    State::Pending | State::Waiting | State::Running => have_runnable = true,
                    State::Failed | State::Error => have_error = true,
                    State::Success => {}
                }

                if s == State::Pending {
                    let srv = &self.catalog.services[&path];
                    s = self.readiness(srv, &st.dep_state);
                    st.service_state.insert(path.clone(), s);
                }

                if s == State::Waiting {
                    st.service_state.insert(path.clone(), State::Running);
                    have_runnable = true;
                    to_dispatch.push(path);
                }
            }
        }

        for path in to_dispatch {
            self.dispatch(path, tx.clone(), pool);
        }

        (have_runnable, have_error)
    }

    fn readiness(
        &self,
        srv: &crate::script::Service,
        dep_state: &HashMap<String, State>,
    ) -> State {
        let edges = srv.edges(self.phase.edge_property());
        match self.phase {
            Phase::Start => {
                for token in edges {
                    match dep_state.get(token).copied().unwrap_or(State::Pending) {
                        State::Failed | State::Error => return State::Error,
                        State::Success => {}
                        _ => return State::Pending,
                    }
                }
                State::Waiting
            }
            Phase::Stop => {
                for token in edges {
                    match dep_state.get(token).copied().unwrap_or(State::Pending) {
                        State::Pending | State::Waiting | State::Running => return State::Pending,
                        _ => {}
                    }
                }
                State::Waiting
            }
        }
    }

    fn dispatch(&self, path: PathBuf, tx: mpsc::Sender<ExecuteResult>, pool: &ThreadPool) {
        let catalog = Arc::clone(&self.catalog);
        let supervisor = Arc::clone(&self.supervisor);
        let phase = self.phase;

        pool.execute(move || {
            let srv = &catalog.services[&path];
            let success = match phase {
                Phase::Start => {
                    if srv.is_non_stop() {
                        match supervisor.spawn(&path) {
                            Some(pid) => {
                                *srv.process.lock().unwrap() = Some(pid);
                                true
                            }
                            None => false,
                        }
                    } else {
                        supervisor.run(&path, "start")
                    }
                }
                Phase::Stop => {
                    if srv.is_non_stop() {
                        let pid = *srv.process.lock().unwrap();
                        match pid {
                            Some(pid) => supervisor.signal_pid(pid),
                            None => false,
                        }
                    } else {
                        supervisor.run(&path, "stop")
                    }
                }
            };

            let state = if success { State::Success } else { State::Failed };
            let _ = tx.send(ExecuteResult { script: path, state });
        });
    }

    fn apply_result(&self, state: &Mutex<RunState>, result: ExecuteResult) {
        let mut st = state.lock().unwrap();
        st.service_state.insert(result.script.clone(), result.state);

        let provides = self.catalog.services[&result.script].provides().clone();
        for token in provides {
            let entry = st.dep_state.entry(token).or_insert(State::Pending);
            if result.state == State::Success {
                *entry = State::Success;
            } else if *entry != State::Success {
                *entry = result.state;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::ServiceCatalog;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;

    fn write_fixture(dir: &Path, name: &str, header: &str, exit_code: u8) -> PathBuf {
        let path = dir.join(name);
        fs::write(
            &path,
            format!("#!/bin/sh\n{header}\nexit {exit_code}\n"),
        )
        .unwrap();
        let mut perms = fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&path, perms).unwrap();
        path
    }

    #[test]
    fn linear_chain_starts_in_order() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(
            dir.path(),
            "a",
            "### BEGIN INIT INFO\n# Provides: a\n### END INIT INFO",
            0,
        );
        write_fixture(
            dir.path(),
            "b",
            "### BEGIN INIT INFO\n# Provides: b\n# Required-Start: a\n### END INIT INFO",
            0,
        );
        write_fixture(
            dir.path(),
            "c",
            "### BEGIN INIT INFO\n# Provides: c\n# Required-Start: b\n### END INIT INFO",
            0,
        );

        let catalog = Arc::new(ServiceCatalog::load(dir.path()).unwrap());
        let supervisor = Arc::new(Supervisor::new());
        let executor = Executor::new(catalog, Phase::Start, supervisor);
        assert!(executor.execute());
    }

    #[test]
    fn failure_propagates_to_dependents() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(
            dir.path(),
            "db",
            "### BEGIN INIT INFO\n# Provides: db\n### END INIT INFO",
            1,
        );
        write_fixture(
            dir.path(),
            "api",
            "### BEGIN INIT INFO\n# Provides: api\n# Required-Start: db\n### END INIT INFO",
            0,
        );

        let catalog = Arc::new(ServiceCatalog::load(dir.path()).unwrap());
        let supervisor = Arc::new(Supervisor::new());
        let executor = Executor::new(catalog, Phase::Start, supervisor);
        assert!(!executor.execute());
    }

    #[test]
    fn success_wins_among_duplicate_providers() {
        let dir = tempfile::tempdir().unwrap();
        write_fixture(
            dir.path(),
            "p1",
            "### BEGIN INIT INFO\n# Provides: p\n### END INIT INFO",
            0,
        );
        write_fixture(
            dir.path(),
            "p2",
            "### BEGIN INIT INFO\n# Provides: p\n### END INIT INFO",
            1,
        );
        write_fixture(
            dir.path(),
            "dep",
            "### BEGIN INIT INFO\n# Provides: d\n# Required-Start: p\n### END INIT INFO",
            0,
        );

        let catalog = Arc::new(ServiceCatalog::load(dir.path()).unwrap());
        let supervisor = Arc::new(Supervisor::new());
        let executor = Executor::new(catalog, Phase::Start, supervisor);
        assert!(executor.execute());
    }

    #[test]
    fn empty_confdir_start_is_vacuously_true() {
        let dir = tempfile::tempdir().unwrap();
        let catalog = Arc::new(ServiceCatalog::load(dir.path()).unwrap());
        let supervisor = Arc::new(Supervisor::new());
        let executor = Executor::new(catalog, Phase::Start, supervisor);
        assert!(executor.execute());
    }
}
