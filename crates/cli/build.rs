fn main() {
    let mut features = vec!["txt", "md", "html"];
    if cfg!(feature = "pdf") {
        features.push("pdf");
    }
    println!("cargo:rustc-env=DOCQA_FEATURES={}", features.join(", "));
}
