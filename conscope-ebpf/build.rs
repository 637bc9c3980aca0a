use which::which;

/// The eBPF object is linked by `bpf-linker`, which cargo knows nothing about.
/// Rebuild whenever the linker binary changes.
fn main() {
    match which("bpf-linker") {
        Ok(bpf_linker) => println!("cargo:rerun-if-changed={}", bpf_linker.display()),
        Err(_) => println!("cargo:warning=bpf-linker not found in PATH"),
    }
}
