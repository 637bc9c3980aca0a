use std::path::{Path, PathBuf};
use std::process::Command;
use std::{env, fs};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};

const BINARY: &str = "conscope";

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build, run and package conscope")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build the agent with its embedded eBPF object
    Build {
        #[arg(long)]
        release: bool,

        /// Target triple for cross-compilation (e.g. aarch64-unknown-linux-gnu)
        #[arg(long)]
        target: Option<String>,
    },

    /// Build, then run the agent as root, passing the environment through
    Run {
        #[arg(long)]
        release: bool,

        /// Arguments forwarded to the agent
        #[arg(last = true)]
        args: Vec<String>,
    },

    /// Build a release tarball with an install script and a systemd unit
    Package {
        #[arg(long)]
        target: Option<String>,

        #[arg(long, default_value = "dist")]
        output: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Build { release, target } => {
            build(release, target.as_deref())?;
        }
        Commands::Run { release, args } => {
            run(release, &args)?;
        }
        Commands::Package { target, output } => {
            package(target.as_deref(), &output)?;
        }
    }

    Ok(())
}

fn project_root() -> Result<PathBuf> {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .parent()
        .map(Path::to_path_buf)
        .context("xtask must live inside the workspace")
}

fn binary_path(root: &Path, release: bool, target: Option<&str>) -> PathBuf {
    let profile = if release { "release" } else { "debug" };
    let mut path = root.join("target");
    if let Some(t) = target {
        path.push(t);
    }
    path.join(profile).join(BINARY)
}

fn build(release: bool, target: Option<&str>) -> Result<PathBuf> {
    let root = project_root()?;

    println!("Building {BINARY}...");

    // Linux targets from a non-Linux host go through `cross`.
    let cross_compile = target.is_some_and(|t| t.contains("linux")) && !cfg!(target_os = "linux");
    let build_cmd = if cross_compile {
        if which::which("cross").is_err() {
            bail!(
                "Cross-compilation to Linux requires 'cross' tool.\n\
                 Install with: cargo install cross\n\
                 Also requires Docker to be running."
            );
        }
        "cross"
    } else {
        "cargo"
    };

    let mut cmd = Command::new(build_cmd);
    cmd.current_dir(&root).arg("build").arg("-p").arg(BINARY);
    if release {
        cmd.arg("--release");
    }
    if let Some(t) = target {
        cmd.arg("--target").arg(t);
        println!("   Target: {}", t);
    }

    let status = cmd.status().context("Failed to run cargo build")?;
    if !status.success() {
        bail!("Build failed");
    }

    let binary = binary_path(&root, release, target);
    println!("Build complete: {}", binary.display());
    Ok(binary)
}

fn run(release: bool, args: &[String]) -> Result<()> {
    let binary = build(release, None)?;

    let status = Command::new("sudo")
        .arg("-E")
        .arg(&binary)
        .args(args)
        .status()
        .context("Failed to run sudo")?;
    if !status.success() {
        bail!("{BINARY} exited with {status}");
    }
    Ok(())
}

fn systemd_unit(env_file: Option<&str>) -> String {
    let env_line = env_file
        .map(|c| format!("EnvironmentFile={}\n", c))
        .unwrap_or_default();

    format!(
        r#"[Unit]
Description=conscope container activity statistics
After=network.target

[Service]
Type=simple
ExecStart=/usr/local/bin/{BINARY}
Restart=on-failure
RestartSec=5
{env_line}
CapabilityBoundingSet=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON
AmbientCapabilities=CAP_SYS_ADMIN CAP_BPF CAP_PERFMON

[Install]
WantedBy=multi-user.target
"#
    )
}

fn install_script() -> String {
    format!(
        r#"#!/bin/bash
set -e

INSTALL_DIR="${{INSTALL_DIR:-/usr/local/bin}}"
CONFIG_DIR="${{CONFIG_DIR:-/etc/{BINARY}}}"

sudo install -m 755 {BINARY} "$INSTALL_DIR/{BINARY}"
sudo mkdir -p "$CONFIG_DIR"
if [ -f {BINARY}.env.example ] && [ ! -f "$CONFIG_DIR/{BINARY}.env" ]; then
    sudo cp {BINARY}.env.example "$CONFIG_DIR/{BINARY}.env"
fi
sudo install -m 644 {BINARY}.service /etc/systemd/system/{BINARY}.service
sudo systemctl daemon-reload

echo "Installed to $INSTALL_DIR/{BINARY}"
echo "Start with: sudo systemctl enable --now {BINARY}"
"#
    )
}

fn package(target: Option<&str>, output_dir: &str) -> Result<()> {
    let binary = build(true, target)?;
    if !binary.exists() {
        bail!("Binary not found at: {}", binary.display());
    }

    let root = project_root()?;
    let output_path = root.join(output_dir);
    let arch = target.unwrap_or(env::consts::ARCH);
    let package_name = format!("{BINARY}-{}-{}", env!("CARGO_PKG_VERSION"), arch);
    let package_dir = output_path.join(&package_name);
    fs::create_dir_all(&package_dir).context("Failed to create output directory")?;

    fs::copy(&binary, package_dir.join(BINARY))?;
    let env_example = root.join("example.env");
    if env_example.exists() {
        fs::copy(&env_example, package_dir.join(format!("{BINARY}.env.example")))?;
    }
    fs::write(
        package_dir.join(format!("{BINARY}.service")),
        systemd_unit(Some(&format!("/etc/{BINARY}/{BINARY}.env"))),
    )?;
    fs::write(package_dir.join("install.sh"), install_script())?;

    let tarball = output_path.join(format!("{package_name}.tar.gz"));
    let status = Command::new("tar")
        .current_dir(&output_path)
        .arg("-czf")
        .arg(&tarball)
        .arg(&package_name)
        .status()
        .context("Failed to create tarball")?;
    if !status.success() {
        bail!("Failed to create tarball");
    }

    fs::remove_dir_all(&package_dir)?;
    println!("Package created: {}", tarball.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binary_path() {
        let root = Path::new("/src/conscope");
        assert_eq!(
            binary_path(root, true, None),
            PathBuf::from("/src/conscope/target/release/conscope")
        );
        assert_eq!(
            binary_path(root, false, Some("aarch64-unknown-linux-gnu")),
            PathBuf::from("/src/conscope/target/aarch64-unknown-linux-gnu/debug/conscope")
        );
    }

    #[test]
    fn test_systemd_unit_env_file() {
        let unit = systemd_unit(Some("/etc/conscope/conscope.env"));
        assert!(unit.contains("ExecStart=/usr/local/bin/conscope\n"));
        assert!(unit.contains("EnvironmentFile=/etc/conscope/conscope.env\n"));
        assert!(!systemd_unit(None).contains("EnvironmentFile"));
    }

    #[test]
    fn test_install_script_paths() {
        let script = install_script();
        assert!(script.contains(r#"CONFIG_DIR="${CONFIG_DIR:-/etc/conscope}""#));
        assert!(script.contains("/etc/systemd/system/conscope.service"));
    }
}
