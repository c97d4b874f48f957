//! Build script for phantom-fw
//!
//! Embeds build-time information (git commit, dirty status, build timestamp)
//! that ends up in the version string reported over the C ABI.

fn main() {
    shadow_rs::ShadowBuilder::builder()
        .build()
        .expect("Failed to generate build info");
}
