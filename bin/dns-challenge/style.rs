//! Terminal styling for command output

pub const RESET: &str = "\x1b[0m";
pub const BOLD: &str = "\x1b[1m";
pub const RED: &str = "\x1b[31m";
pub const GREEN: &str = "\x1b[32m";
pub const YELLOW: &str = "\x1b[33m";
pub const CYAN: &str = "\x1b[36m";
pub const GRAY: &str = "\x1b[90m";

pub fn icon_success() -> String {
    format!("{}✓{}", GREEN, RESET)
}

pub fn icon_error() -> String {
    format!("{}✗{}", RED, RESET)
}

pub fn print_success(msg: &str) {
    println!("{} {}", icon_success(), msg);
}

pub fn print_error(msg: &str) {
    eprintln!("{} {}{}{}", icon_error(), RED, msg, RESET);
}

pub fn print_warning(msg: &str) {
    eprintln!("{}⚠ {}{}", YELLOW, msg, RESET);
}

pub fn print_header(title: &str) {
    println!();
    println!(
        "{}{} {} {}{}",
        BOLD,
        CYAN,
        title,
        "─".repeat(50usize.saturating_sub(title.len())),
        RESET
    );
    println!();
}

pub fn print_key_value(key: &str, value: &str) {
    println!("  {}{}:{} {}", GRAY, key, RESET, value);
}
