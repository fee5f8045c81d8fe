fn main() {
    std::process::exit(batchmine::run());
}
