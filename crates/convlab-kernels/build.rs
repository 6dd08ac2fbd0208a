use std::env;

fn main() {
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/kernels/conv2d.cu");

    if env::var_os("CARGO_FEATURE_CUDA").is_none() {
        return;
    }

    if let Some(root) = env::var_os("CUDA_PATH").or_else(|| env::var_os("CUDA_HOME")) {
        let root = std::path::PathBuf::from(root);
        println!("cargo:rustc-link-search={}", root.join("lib64").display());
        println!("cargo:rustc-link-search={}", root.join("lib64/stubs").display());
    }

    println!("cargo:rustc-link-search=/usr/local/cuda/lib64");
    println!("cargo:rustc-link-search=/usr/local/cuda/lib64/stubs");
    println!("cargo:rustc-link-search=/usr/local/cuda/targets/x86_64-linux/lib");
    println!("cargo:rustc-link-search=/usr/local/cuda/targets/aarch64-linux/lib");
    println!("cargo:rustc-link-search=/usr/lib/x86_64-linux-gnu");
    println!("cargo:rustc-link-search=/usr/lib64");

    println!("cargo:rustc-link-lib=cuda");
    println!("cargo:rustc-link-lib=nvrtc");
}
