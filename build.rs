// Stamp the binary with its build time for `--version`

fn main() {
    let built = chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z");
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", built);
}
