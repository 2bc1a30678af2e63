// Copyright (c) Contributors to the sandboxfs project.
// SPDX-License-Identifier: Apache-2.0

//! The sandboxfs binary mounts an instance of the sandboxfs file system.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Parser, ValueEnum};
use fuser::MountOption;
use sandboxfs::{Config, Filesystem, Mapping, Session};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::prelude::*;

fn main() {
    // because this function exits right away it does not properly handle
    // destruction of data, so we put the actual logic into a separate
    // function/scope
    std::process::exit(main2())
}

fn main2() -> i32 {
    let opt = Sandboxfs::parse();
    configure_logging(opt.debug);

    match opt.run() {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            1
        }
    }
}

/// Mounts an instance of the sandboxfs file system.
#[derive(Debug, Parser)]
#[clap(name = "sandboxfs", version)]
struct Sandboxfs {
    /// Specifies who should have access to the file system
    #[clap(long, value_enum, default_value = "self")]
    allow: Allow,

    /// Log details about FUSE requests and responses to stderr
    #[clap(long)]
    debug: bool,

    /// Where to read reconfiguration commands from (- for stdin)
    #[clap(long, default_value = "-")]
    input: String,

    /// Mappings of the form TYPE:PATH:TARGET with TYPE one of ro, rw
    #[clap(long = "mapping", value_name = "TYPE:PATH:TARGET")]
    mappings: Vec<Mapping>,

    /// Where to write the status of reconfigurations to (- for stdout)
    #[clap(long, default_value = "-")]
    output: String,

    /// Name for the sandboxfs volume
    #[clap(long = "volume_name", default_value = "sandbox")]
    volume_name: String,

    /// Directory on which to mount the file system
    mount_point: PathBuf,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Allow {
    /// Only the user that mounted the file system
    #[value(name = "self")]
    CurrentUser,
    /// Any user, including root
    Other,
    /// Only root in addition to the mounting user
    Root,
}

impl Allow {
    fn mount_option(self) -> Option<MountOption> {
        match self {
            Allow::CurrentUser => None,
            Allow::Other => Some(MountOption::AllowOther),
            Allow::Root => Some(MountOption::AllowRoot),
        }
    }
}

impl Sandboxfs {
    fn run(&self) -> Result<i32> {
        // Test for the mount point's existence explicitly so that the error
        // message is consistent across platforms and FUSE implementations.
        // Knowingly racy; the mount operation rechecks.
        if nix::sys::stat::lstat(&self.mount_point).is_err() {
            bail!("unable to mount: {} does not exist", self.mount_point.display());
        }

        let opts = Config {
            uid: nix::unistd::geteuid(),
            gid: nix::unistd::getegid(),
            mount_options: self.mount_options(),
        };
        let fs = Arc::new(
            Filesystem::new(&self.mappings, opts.clone()).context("unable to init sandbox")?,
        );

        let mount_options = opts.mount_options.iter().cloned().collect::<Vec<_>>();
        tracing::debug!("mounting file system onto {:?}", self.mount_point);
        let mut session = match fuser::Session::new(
            Session::new(Arc::clone(&fs)),
            &self.mount_point,
            &mount_options,
        ) {
            Ok(session) => session,
            Err(err) => {
                // Mounting can fail after the mount point was registered
                // with the kernel, e.g. when a signal races the fusermount
                // handshake. Try to clean it up; there is no way to tell
                // upfront whether this is needed.
                best_effort_unmount(&self.mount_point);
                return Err(anyhow!(err).context("unable to mount"));
            }
        };
        let notifier = session.notifier();
        let mut unmounter = session.unmount_callable();

        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .context("failed to establish runtime")?;

        let result = rt.block_on(async move {
            let mut hangup = signal(SignalKind::hangup()).context("hangup signal handler")?;
            let mut interrupt = signal(SignalKind::interrupt()).context("interrupt signal handler")?;
            let mut quit = signal(SignalKind::quit()).context("quit signal handler")?;
            let mut terminate = signal(SignalKind::terminate()).context("terminate signal handler")?;

            let reconfig = {
                let fs = Arc::clone(&fs);
                let input = open_input(&self.input).await?;
                let output = open_output(&self.output).await?;
                tokio::task::spawn(async move {
                    let invalidator = Arc::new(notifier);
                    if let Err(err) = sandboxfs::reconfig::run(fs, invalidator, input, output).await
                    {
                        tracing::error!("reconfiguration loop failed: {err}");
                    }
                })
            };

            tracing::info!("serving file system on {:?}", self.mount_point);
            let mut serve = tokio::task::spawn_blocking(move || session.run());
            let caught = tokio::select! {
                res = &mut serve => {
                    reconfig.abort();
                    res.context("FUSE worker panicked")?
                        .context("serve error")?;
                    return Ok(0);
                }
                _ = hangup.recv() => "SIGHUP",
                _ = interrupt.recv() => "SIGINT",
                _ = quit.recv() => "SIGQUIT",
                _ = terminate.recv() => "SIGTERM",
            };

            // Make the mount point vanish so that the serve loop terminates.
            // If unmounting fails the file system is probably busy; we have
            // entered a terminal state either way, so keep trying while
            // telling the user what is going on.
            let mut backoff = Duration::from_millis(10);
            loop {
                match unmounter.unmount() {
                    Ok(()) => break,
                    Err(err) => {
                        tracing::warn!(
                            "unmounting filesystem failed with error: {err}; will retry in {backoff:?}"
                        );
                        tokio::time::sleep(backoff).await;
                        backoff = (backoff * 2).min(Duration::from_secs(1));
                    }
                }
            }
            let _ = serve.await;
            reconfig.abort();
            Err(anyhow!("caught signal: {caught}"))
        });

        // don't block forever on lingering tasks when the runtime drops
        rt.shutdown_timeout(Duration::from_millis(250));
        result
    }

    fn mount_options(&self) -> HashSet<MountOption> {
        let mut options = HashSet::from([
            // Rely on in-kernel permission checking based on each node's
            // reported ownership and mode instead of implementing access.
            MountOption::DefaultPermissions,
            MountOption::NoDev,
            MountOption::NoSuid,
            MountOption::FSName("sandboxfs".to_owned()),
            MountOption::Subtype("sandboxfs".to_owned()),
        ]);
        if cfg!(target_os = "macos") {
            options.insert(MountOption::CUSTOM(format!("volname={}", self.volume_name)));
        }
        if let Some(allow) = self.allow.mount_option() {
            options.insert(allow);
        }
        options
    }
}

async fn open_input(spec: &str) -> Result<Box<dyn AsyncRead + Send + Unpin>> {
    if spec == "-" {
        return Ok(Box::new(tokio::io::stdin()));
    }
    let file = tokio::fs::File::open(spec)
        .await
        .with_context(|| format!("unable to open file {spec:?} for reading"))?;
    Ok(Box::new(file))
}

async fn open_output(spec: &str) -> Result<Box<dyn AsyncWrite + Send + Unpin>> {
    if spec == "-" {
        return Ok(Box::new(tokio::io::stdout()));
    }
    let file = tokio::fs::File::create(spec)
        .await
        .with_context(|| format!("unable to open file {spec:?} for writing"))?;
    Ok(Box::new(file))
}

/// Unmounts a possibly half-established mount point, ignoring failures.
fn best_effort_unmount(mount_point: &std::path::Path) {
    #[cfg(target_os = "linux")]
    {
        let _ = std::process::Command::new("fusermount")
            .arg("-u")
            .arg("-q")
            .arg(mount_point)
            .status();
    }
    #[cfg(not(target_os = "linux"))]
    {
        let _ = std::process::Command::new("umount").arg(mount_point).status();
    }
}

fn configure_logging(debug: bool) {
    let mut config = if debug {
        "sandboxfs=trace,debug".to_owned()
    } else {
        "sandboxfs=info,warn".to_owned()
    };
    if let Ok(overrides) = std::env::var("RUST_LOG") {
        config.push(',');
        config.push_str(&overrides);
    }
    let env_filter = tracing_subscriber::filter::EnvFilter::from(config);
    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false);
    let sub = tracing_subscriber::Registry::default()
        .with(env_filter)
        .with(fmt_layer);
    tracing::subscriber::set_global_default(sub).expect("logging is configured exactly once");
}
