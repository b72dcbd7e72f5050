fn main() -> std::process::ExitCode {
    potion_bridge_lib::run()
}
