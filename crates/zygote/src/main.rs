use std::{ffi::CString, path::Path, process::exit};

use clap::Parser;
use eyre::{WrapErr, eyre};
use libc::{pid_t, setsid};
use rustix::{
    fs::Mode,
    process::{chdir, umask},
};
use tracing::{error, info};
use zygote::{PathPolicy, ServerOptions, Spawned, bootstrap};

pub mod cli;
pub mod tracing_init;

use crate::{cli::Args, tracing_init::init_tracing};

/// Daemonize (advanced programming in the unix environment)
fn daemon_double_fork() {
    do_fork();

    let sid = unsafe { setsid() };
    if sid < 0 {
        eprintln!("setsid failed");
        exit(-1);
    }

    // cannot be killed by parent
    unsafe {
        libc::signal(libc::SIGHUP, libc::SIG_IGN);
    }

    // really shake them off our tail
    do_fork();

    // no risk of unmounting
    chdir("/").unwrap();

    // clear umask
    umask(Mode::empty());

    // redirect the stds to dev null
    redirect_std_fds_to_devnull();
}

fn redirect_std_fds_to_devnull() {
    use std::{fs::OpenOptions, os::unix::io::AsRawFd};

    let devnull = OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .expect("failed to open /dev/null");

    let fd = devnull.as_raw_fd();
    unsafe {
        libc::dup2(fd, 0);
        libc::dup2(fd, 1);
        libc::dup2(fd, 2);
    }
}

fn do_fork() {
    let pid: pid_t = unsafe { libc::fork() };

    match pid {
        p if p < 0 => {
            eprintln!("unable to fork");
            exit(-1);
        }
        0 => {}       // child
        _ => exit(0), // parent
    }
}

/// Replace this process image with `argv`. Only returns on failure.
fn exec_argv(argv: &[String]) -> eyre::Result<()> {
    let cargs: Vec<CString> = argv
        .iter()
        .map(|a| CString::new(a.as_str()))
        .collect::<Result<_, _>>()
        .wrap_err("argv contained a NUL byte")?;
    let program = cargs
        .first()
        .ok_or_else(|| eyre!("fork request carried an empty argv"))?;
    nix::unistd::execvp(program, &cargs)
        .wrap_err_with(|| format!("execvp {argv:?} failed"))?;
    Ok(())
}

fn main() -> eyre::Result<()> {
    let args = Args::parse();

    let Args::Serve {
        daemonize,
        ref lock_path,
        ref pak_suffix,
        ..
    } = args;
    if daemonize {
        daemon_double_fork();
    }
    let log_fd = init_tracing(&args);

    let opts = ServerOptions {
        policy: PathPolicy {
            required_suffix: pak_suffix.clone(),
            ..PathPolicy::default()
        },
        log_fd,
        ..ServerOptions::default()
    };

    match bootstrap::start(Path::new(lock_path), opts)? {
        Spawned::Host(host) => {
            host.ping().wrap_err("fork server did not answer a ping")?;
            info!("fork server up, waiting for Ctrl-C");

            let (tx, rx) = std::sync::mpsc::channel();
            ctrlc::set_handler(move || {
                let _ = tx.send(());
            })
            .wrap_err("could not install Ctrl-C handler")?;
            let _ = rx.recv();

            info!("shutting down");
            // dropping the host closes the canary; the manager exits
            drop(host);
        }
        Spawned::ServerExec { argv } => {
            // we are a fork-request child: become the requested image
            exec_argv(&argv)?;
        }
        Spawned::ServerExited(why) => {
            error!(?why, "fork server exited");
        }
    }

    Ok(())
}
