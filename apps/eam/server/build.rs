use chrono::Utc;

fn main() {
    // Build id shown by `eam version` and `/api/versions`.
    let build_id = Utc::now().format("%Y%m%d%H%M%S").to_string();
    println!("cargo:rustc-env=EAM_BUILD_ID={build_id}");
    println!("cargo:rerun-if-changed=build.rs");
    println!("cargo:rerun-if-changed=src/");
}
