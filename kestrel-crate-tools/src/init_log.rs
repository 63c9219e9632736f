use std::io::Write;

use anstyle::{AnsiColor, Color, Style};

fn level_style(level: log::Level) -> Style {
    let color = match level {
        log::Level::Error => AnsiColor::Red,
        log::Level::Warn => AnsiColor::Yellow,
        log::Level::Info => AnsiColor::Green,
        log::Level::Debug => AnsiColor::Cyan,
        log::Level::Trace => AnsiColor::BrightBlack,
    };
    Style::new().fg_color(Some(Color::Ansi(color))).bold()
}

pub fn init_log() {
    env_logger::Builder::new()
        .format(|buf, record| {
            let style = level_style(record.level());
            let dim = Style::new().fg_color(Some(Color::Ansi(AnsiColor::BrightBlack)));
            let time = chrono::Local::now().format("%H:%M:%S%.3f");
            writeln!(
                buf,
                "{time} {style}{:5}{style:#} {} {dim}[{}:{}]{dim:#}",
                record.level(),
                record.args(),
                record.target(),
                record.line().unwrap_or(0),
            )
        })
        .filter(None, log::LevelFilter::Info)
        .try_init()
        .ok();
}
