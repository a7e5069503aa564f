//! Host-side build and run helper.
//!
//! `cargo xtask build` cross-compiles the kernel for the bare-metal
//! target; `cargo xtask run` boots the result in QEMU; `cargo xtask test`
//! runs the hosted unit-test suites.

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use std::process::Command;

const KERNEL_TARGET: &str = "x86_64-unknown-none";

#[derive(Parser)]
#[command(about = "VesperOS build tasks")]
struct Cli {
    #[command(subcommand)]
    command: Task,
}

#[derive(Subcommand)]
enum Task {
    /// Build the kernel for the bare-metal target.
    Build {
        #[arg(long)]
        release: bool,
    },
    /// Build and boot the kernel in QEMU.
    Run {
        #[arg(long)]
        release: bool,
        /// Extra arguments passed straight to QEMU.
        #[arg(last = true)]
        qemu_args: Vec<String>,
    },
    /// Run the hosted unit tests.
    Test,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Task::Build { release } => build_kernel(release),
        Task::Run { release, qemu_args } => {
            build_kernel(release)?;
            run_qemu(release, &qemu_args)
        }
        Task::Test => run_tests(),
    }
}

fn build_kernel(release: bool) -> Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.args(["build", "-p", "kernel", "--target", KERNEL_TARGET]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd.status().context("running cargo build")?;
    if !status.success() {
        bail!("kernel build failed");
    }
    Ok(())
}

fn run_qemu(release: bool, extra: &[String]) -> Result<()> {
    let profile = if release { "release" } else { "debug" };
    let kernel = format!("target/{}/{}/vesper", KERNEL_TARGET, profile);

    let mut cmd = Command::new("qemu-system-x86_64");
    cmd.args(["-serial", "stdio", "-display", "none", "-m", "512M"]);
    cmd.args(["-kernel", &kernel]);
    cmd.args(extra);
    let status = cmd.status().context("running qemu-system-x86_64")?;
    if !status.success() {
        bail!("qemu exited with {}", status);
    }
    Ok(())
}

fn run_tests() -> Result<()> {
    let status = Command::new("cargo")
        .args(["test", "-p", "kernel"])
        .status()
        .context("running cargo test")?;
    if !status.success() {
        bail!("tests failed");
    }
    Ok(())
}
