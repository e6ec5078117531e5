use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use save_backup::config::Config;
use save_backup::ConfigManager;
use std::process;
use tracing_subscriber::EnvFilter;

mod commands;

const LOG_VAR: &str = "SAVE_BACKUP_LOG";

fn save_args<'a, 'b>(required: bool) -> Vec<Arg<'a, 'b>> {
    let friendly = Arg::with_name("friendly")
        .short("f")
        .long("friendly")
        .value_name("NAME")
        .takes_value(true)
        .help("The friendly name of the save.");

    let path = Arg::with_name("path").help("The path of the save.").index(1);
    let path = if required {
        path.required_unless("friendly")
    } else {
        path
    };

    vec![friendly, path]
}

fn main() {
    let matches = App::new("Save Backup")
        .version("0.1.0")
        .author("paoda <musukarekai@gmail.com>")
        .about("Incrementally backs up saved game data.")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("verbose")
                .short("v")
                .long("verbose")
                .global(true)
                .help("Log debug output."),
        )
        .subcommand(
            SubCommand::with_name("add")
                .about("Adds path to list of tracked saves.")
                .arg(
                    Arg::with_name("friendly")
                        .short("f")
                        .long("friendly")
                        .value_name("NAME")
                        .takes_value(true)
                        .help("The friendly name of the save"),
                )
                .arg(
                    Arg::with_name("path")
                        .help("The path which will be added")
                        .index(1)
                        .required(true),
                ),
        )
        .subcommand(
            SubCommand::with_name("delete")
                .about("Stops tracking a save and removes its backup region.")
                .alias("del")
                .args(&save_args(true)),
        )
        .subcommand(SubCommand::with_name("list").about("Lists every tracked save"))
        .subcommand(
            SubCommand::with_name("info")
                .about("Display information about a save.")
                .args(&save_args(true))
                .arg(
                    Arg::with_name("delta")
                        .short("d")
                        .long("delta")
                        .help("Determines which files have changed since last backup."),
                ),
        )
        .subcommand(
            SubCommand::with_name("update")
                .about("Backs up one save, or every save of the local user.")
                .args(&save_args(false)),
        )
        .subcommand(
            SubCommand::with_name("restore")
                .about("Writes the latest backup of a save into a directory.")
                .args(&save_args(true))
                .arg(
                    Arg::with_name("target")
                        .long("to")
                        .value_name("DIR")
                        .takes_value(true)
                        .required(true)
                        .help("Directory the files are restored into"),
                ),
        )
        .subcommand(
            SubCommand::with_name("export")
                .about("Writes the latest backup of a save as a .tar.zst archive.")
                .args(&save_args(true))
                .arg(
                    Arg::with_name("archive")
                        .short("o")
                        .long("output")
                        .value_name("FILE")
                        .takes_value(true)
                        .help("Archive location, defaults to the save's backup directory"),
                ),
        )
        .subcommand(
            SubCommand::with_name("verify")
                .about("Checks the stored contents of a save.")
                .args(&save_args(true)),
        )
        .get_matches();

    init_logging(&matches);

    if let Err(err) = run(&matches) {
        eprintln!("Error: {:?}", err);
        process::exit(1);
    }
}

fn init_logging(matches: &ArgMatches) {
    let default = if matches.is_present("verbose") {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_env(LOG_VAR).unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(matches: &ArgMatches) -> anyhow::Result<()> {
    // Creates the settings file on first use, loads it otherwise
    let manager = ConfigManager::default();
    let manager = ConfigManager::new(manager.path().to_path_buf())?;
    let config = Config::clone_config();

    match matches.subcommand() {
        ("add", Some(sub_matches)) => commands::add_save(&config, &manager, sub_matches),
        ("delete", Some(sub_matches)) => commands::delete_save(&config, &manager, sub_matches),
        ("list", Some(_sub_matches)) => commands::list_tracked(&config, &manager),
        ("info", Some(sub_matches)) => commands::get_info(&config, &manager, sub_matches),
        ("update", Some(sub_matches)) => commands::update_saves(&config, &manager, sub_matches),
        ("restore", Some(sub_matches)) => commands::restore_save(&config, &manager, sub_matches),
        ("export", Some(sub_matches)) => commands::export_save(&config, &manager, sub_matches),
        ("verify", Some(sub_matches)) => commands::verify_save(&config, &manager, sub_matches),
        _ => Ok(()),
    }
}
