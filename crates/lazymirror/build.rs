use std::io;
use std::process::{Command, Stdio};

fn git(args: &[&str]) -> Result<String, io::Error> {
    let cmd = Command::new("git")
        .args(args)
        .stderr(Stdio::inherit())
        .output()?;

    if !cmd.status.success() {
        return Err(io::Error::other(format!(
            "`git {}` failed: {}",
            args.join(" "),
            cmd.status
        )));
    }

    Ok(String::from_utf8_lossy(&cmd.stdout).trim().to_owned())
}

fn emit_var(name: &str, args: &[&str]) {
    // Source tarballs are built without a repository around them.
    let value = git(args).unwrap_or_else(|_| "unknown".to_owned());

    println!("cargo:rustc-env={name}={value}");
    println!("cargo:rerun-if-env-changed={name}");
}

fn main() {
    emit_var("LAZYMIRROR_GIT_VERSION", &["describe", "--always", "--dirty=-modified"]);
    emit_var("LAZYMIRROR_RELEASE", &["rev-parse", "HEAD"]);
}
