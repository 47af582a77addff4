use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use log::{error, info};
use signal_hook::consts::{SIGCHLD, SIGINT, SIGTERM};
use signal_hook::iterator::Signals;

use ynit::catalog::ServiceCatalog;
use ynit::config;
use ynit::executor::{Executor, Phase};
use ynit::supervisor::Supervisor;
use ynit::syslog::SyslogSink;

fn main() -> ExitCode {
    let cfg = config::load_config();

    if let Err(e) = ynit::logging::setup_logging(cfg.debug) {
        eprintln!("error setting up logging: {e}");
        return ExitCode::FAILURE;
    }

    let syslog = SyslogSink::start(&cfg.syslog);

    let catalog = match ServiceCatalog::load(&cfg.confdir) {
        Ok(catalog) => Arc::new(catalog),
        Err(e) => {
            error!("loading {}: {e}", cfg.confdir.display());
            return ExitCode::FAILURE;
        }
    };

    let supervisor = Arc::new(Supervisor::new());

    // Background signal thread: SIGCHLD triggers a procfs scan inline;
    // SIGTERM/SIGINT are forwarded once over `term_rx` to unblock main.
    let (term_tx, term_rx) = mpsc::channel::<()>();
    {
        let supervisor = Arc::clone(&supervisor);
        let signals =
            Signals::new([SIGCHLD, SIGTERM, SIGINT]).expect("registering signal handlers");
        thread::spawn(move || {
            let mut signals = signals;
            for signal in signals.forever() {
                match signal {
                    SIGCHLD => supervisor.scan(),
                    SIGTERM | SIGINT => {
                        let _ = term_tx.send(());
                    }
                    _ => {}
                }
            }
        });
    }

    let start_ok = Executor::new(Arc::clone(&catalog), Phase::Start, Arc::clone(&supervisor)).execute();
    if !start_ok {
        error!("cannot start all services, quitting");
        Executor::new(Arc::clone(&catalog), Phase::Stop, Arc::clone(&supervisor)).execute();
        shutdown_children(&supervisor);
        if let Some(syslog) = syslog {
            syslog.stop();
        }
        return ExitCode::FAILURE;
    }

    info!("services started, waiting for termination signal");
    let _ = term_rx.recv();

    Executor::new(Arc::clone(&catalog), Phase::Stop, Arc::clone(&supervisor)).execute();
    info!("services stopped, reaping remaining children");
    shutdown_children(&supervisor);

    if let Some(syslog) = syslog {
        syslog.stop();
    }

    ExitCode::SUCCESS
}

/// Close the race between a child exiting during shutdown and our having
/// started waiting for it: scan once more, signal anything still alive,
/// then block until every adopted/launched process has actually exited.
fn shutdown_children(supervisor: &Supervisor) {
    supervisor.scan();
    supervisor.kill_all();
    supervisor.wait();
}
