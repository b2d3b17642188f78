// build.rs
// Compiles the GLSL shaders in shaders/ to SPIR-V when the Vulkan SDK is available

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var("SKIP_SHADERS").is_ok() {
        return;
    }

    let vulkan_sdk = match env::var("VULKAN_SDK") {
        Ok(sdk) => sdk,
        Err(_) => {
            println!("cargo:warning=VULKAN_SDK not set, shader compilation skipped");
            return;
        }
    };

    let glslc = if cfg!(target_os = "windows") {
        format!("{}\\Bin\\glslc.exe", vulkan_sdk)
    } else {
        format!("{}/bin/glslc", vulkan_sdk)
    };
    if !Path::new(&glslc).exists() {
        println!("cargo:warning=glslc not found at {}, shader compilation skipped", glslc);
        return;
    }

    let out_dir = match env::var("OUT_DIR") {
        Ok(dir) => PathBuf::from(dir).join("shaders"),
        Err(_) => return,
    };
    if let Err(e) = std::fs::create_dir_all(&out_dir) {
        println!("cargo:warning=failed to create {}: {}", out_dir.display(), e);
        return;
    }

    let entries = match std::fs::read_dir("shaders") {
        Ok(entries) => entries,
        Err(_) => return,
    };

    let mut failed = false;
    for entry in entries.flatten() {
        let path = entry.path();
        let is_shader = matches!(
            path.extension().and_then(|e| e.to_str()),
            Some("vert" | "frag" | "comp")
        );
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };
        if !is_shader {
            continue;
        }

        let out_file = out_dir.join(format!("{}.spv", name));
        match Command::new(&glslc).arg(&path).arg("-o").arg(&out_file).status() {
            Ok(status) if status.success() => {}
            Ok(status) => {
                println!("cargo:warning=glslc failed for {} ({})", name, status);
                failed = true;
            }
            Err(e) => {
                println!("cargo:warning=failed to run glslc for {}: {}", name, e);
                failed = true;
            }
        }
    }

    if !failed {
        println!("cargo:rustc-env=RENDER_CORE_SHADER_DIR={}", out_dir.display());
    }
}
