use anyhow::{anyhow, bail, Context, Result};
use chrono::Utc;
use clap::ArgMatches;
use save_backup::backup::{Outcome, RunReport, RunStatus};
use save_backup::config::Config;
use save_backup::diff::Change;
use save_backup::lock::SaveLocks;
use save_backup::models::{NewUser, Save, User};
use save_backup::query::{SaveQuery, UserQuery};
use save_backup::{Archive, Backup, BackupOptions, ConfigManager, Database, DiskStore, SaveOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

type Engine = Backup<Database, DiskStore>;

fn open_engine(config: &Config) -> Result<Engine> {
    let db = Database::new(&config.db_location).with_context(|| {
        format!(
            "Unable to open the catalog at \"{}\"",
            config.db_location.display()
        )
    })?;

    let store = DiskStore::new(config.store_location())
        .context("Unable to open the file store")?
        .with_compression_level(config.compression_level)
        .with_verify_existing(config.verify_existing_blobs);

    let lock_dir = config.data_location.join("locks");
    let locks = SaveLocks::in_dir(&lock_dir).with_context(|| {
        format!("Unable to create the lock directory \"{}\"", lock_dir.display())
    })?;

    Ok(Backup::new(db, store, BackupOptions::from(config))?.with_locks(locks))
}

fn archive<'a>(engine: &'a Engine, config: &'a Config) -> Archive<'a, Database, DiskStore> {
    Archive::new(engine.catalog(), engine.store(), &config.data_location)
}

pub fn add_save(config: &Config, manager: &ConfigManager, args: &ArgMatches) -> Result<()> {
    let path = args.value_of("path").context("No save path was provided.")?;
    let engine = open_engine(config)?;
    let user = get_local_user(engine.catalog(), config, manager)?;

    let opt = SaveOptions {
        friendly_name: args.value_of("friendly"),
    };

    let save = archive(&engine, config)
        .register_save(user.id, path, opt)
        .with_context(|| format!("Unable to track \"{}\"", path))?;

    println!("Tracking \"{}\" as {} (id {})", save.save_path, save.friendly_name, save.id);
    Ok(())
}

pub fn delete_save(config: &Config, manager: &ConfigManager, args: &ArgMatches) -> Result<()> {
    let engine = open_engine(config)?;
    let user = get_local_user(engine.catalog(), config, manager)?;
    let save = find_save(engine.catalog(), &user, args)?;

    archive(&engine, config)
        .delete_save(save.id)
        .with_context(|| format!("Unable to delete {}", save.friendly_name))?;

    println!("No longer tracking {}", save.friendly_name);
    Ok(())
}

pub fn list_tracked(config: &Config, manager: &ConfigManager) -> Result<()> {
    let engine = open_engine(config)?;
    let user = get_local_user(engine.catalog(), config, manager)?;
    let saves = engine
        .catalog()
        .find_saves(SaveQuery::new().with_user_id(user.id))?;

    if saves.is_empty() {
        println!("No saves are being tracked.");
    }

    for save in saves {
        println!(
            "{:>4}  {:<24} {} (last changed {})",
            save.id, save.friendly_name, save.save_path, save.modified_at
        );
    }

    Ok(())
}

pub fn get_info(config: &Config, manager: &ConfigManager, args: &ArgMatches) -> Result<()> {
    use save_backup::Catalog;

    let engine = open_engine(config)?;
    let user = get_local_user(engine.catalog(), config, manager)?;
    let save = find_save(engine.catalog(), &user, args)?;
    let files = engine.catalog().list_files(save.id)?;

    println!("Name:        {}", save.friendly_name);
    println!("Save path:   {}", save.save_path);
    println!("Backup path: {}", save.backup_path);
    println!("Created:     {}", save.created_at);
    println!("Modified:    {}", save.modified_at);
    println!("Files:       {}", files.len());

    if args.is_present("delta") {
        let plan = engine
            .plan(save.id)
            .with_context(|| format!("Unable to scan {}", save.friendly_name))?;

        if !plan.has_changes() {
            println!("\nNothing changed since the last backup.");
        }

        for entry in &plan.entries {
            let marker = match entry.change {
                Change::Added => "+",
                Change::Modified => "~",
                Change::Deleted => "-",
                Change::Unscannable => "!",
                Change::Unchanged => continue,
            };
            println!("  {} {}", marker, entry.path);
        }
    }

    Ok(())
}

pub fn update_saves(config: &Config, manager: &ConfigManager, args: &ArgMatches) -> Result<()> {
    let engine = open_engine(config)?;
    let user = get_local_user(engine.catalog(), config, manager)?;

    let saves = if args.is_present("path") || args.is_present("friendly") {
        vec![find_save(engine.catalog(), &user, args)?]
    } else {
        engine
            .catalog()
            .find_saves(SaveQuery::new().with_user_id(user.id))?
    };

    let mut failed = 0;
    for save in &saves {
        debug!(save_id = save.id, name = %save.friendly_name, "starting backup");
        let report = engine.run(save.id);
        print_report(save, &report);

        if report.is_failed() {
            failed += 1;
        }
    }

    if failed > 0 {
        bail!("{} of {} backups failed", failed, saves.len());
    }
    Ok(())
}

pub fn restore_save(config: &Config, manager: &ConfigManager, args: &ArgMatches) -> Result<()> {
    let target = args.value_of("target").context("No target directory was provided.")?;
    let engine = open_engine(config)?;
    let user = get_local_user(engine.catalog(), config, manager)?;
    let save = find_save(engine.catalog(), &user, args)?;

    let restored = archive(&engine, config)
        .restore(save.id, target)
        .with_context(|| format!("Unable to restore {}", save.friendly_name))?;

    println!("Restored {} files into \"{}\"", restored.len(), target);
    Ok(())
}

pub fn export_save(config: &Config, manager: &ConfigManager, args: &ArgMatches) -> Result<()> {
    let engine = open_engine(config)?;
    let user = get_local_user(engine.catalog(), config, manager)?;
    let save = find_save(engine.catalog(), &user, args)?;

    let archive_path = match args.value_of("archive") {
        Some(path) => PathBuf::from(path),
        None => {
            let name = format!("{}.tar.zst", Utc::now().format("%Y-%m-%d_%H-%M-%S"));
            Path::new(&save.backup_path).join(name)
        }
    };

    let count = archive(&engine, config)
        .export(save.id, &archive_path, config.compression_level)
        .with_context(|| format!("Unable to export {}", save.friendly_name))?;

    println!("Exported {} files to \"{}\"", count, archive_path.display());
    Ok(())
}

pub fn verify_save(config: &Config, manager: &ConfigManager, args: &ArgMatches) -> Result<()> {
    let engine = open_engine(config)?;
    let user = get_local_user(engine.catalog(), config, manager)?;
    let save = find_save(engine.catalog(), &user, args)?;

    let verification = archive(&engine, config).verify(save.id)?;

    for path in &verification.missing {
        println!("  missing  {}", path);
    }
    for path in &verification.corrupt {
        println!("  corrupt  {}", path);
    }

    if !verification.is_intact() {
        bail!(
            "{} of {} files of {} cannot be restored",
            verification.missing.len() + verification.corrupt.len(),
            verification.checked,
            save.friendly_name
        );
    }

    println!("All {} files of {} are intact.", verification.checked, save.friendly_name);
    Ok(())
}

fn print_report(save: &Save, report: &RunReport) {
    let added = report.count(|o| *o == Outcome::Added);
    let modified = report.count(|o| *o == Outcome::Modified);
    let deleted = report.count(|o| *o == Outcome::Deleted);

    match &report.status {
        RunStatus::Done => println!(
            "{}: {} added, {} modified, {} deleted",
            save.friendly_name, added, modified, deleted
        ),
        RunStatus::DoneWithWarnings => {
            println!(
                "{}: {} added, {} modified, {} deleted, {} not backed up",
                save.friendly_name,
                added,
                modified,
                deleted,
                report.failed_paths().count()
            );
            for failed in report.failed_paths() {
                match &failed.outcome {
                    Outcome::ReadFailed(err) => println!("  unreadable  {}: {}", failed.path, err),
                    Outcome::StoreFailed(err) => println!("  not stored  {}: {}", failed.path, err),
                    _ => {}
                }
            }
        }
        RunStatus::Failed(err) => println!("{}: backup failed: {}", save.friendly_name, err),
    }
}

fn find_save(db: &Database, user: &User, args: &ArgMatches) -> Result<Save> {
    let mut query = SaveQuery::new().with_user_id(user.id);

    if let Some(path) = args.value_of("path") {
        let path = std::fs::canonicalize(path).unwrap_or_else(|err| {
            debug!(path, error = %err, "unable to canonicalize, matching the path as given");
            PathBuf::from(path)
        });
        query = query.with_path(path);
    }

    if let Some(name) = args.value_of("friendly") {
        query = query.with_friendly_name(name);
    }

    let mut saves = db.find_saves(query)?;

    match saves.len() {
        0 => Err(anyhow!("No matching save is being tracked.")),
        1 => Ok(saves.remove(0)),
        n => Err(anyhow!(
            "{} saves match, pick one by path instead of by name.",
            n
        )),
    }
}

fn get_local_user(db: &Database, config: &Config, manager: &ConfigManager) -> Result<User> {
    let username = &config.local_username;
    let query = UserQuery::new().with_username(username);

    if let Some(user) = db.get_user(query)? {
        return Ok(user);
    }

    // No user found. Is this the first run, or has the configured user changed?
    let mut users = db.get_all_users()?;

    match users.len() {
        0 => {
            let time = Utc::now().naive_utc();
            let new_user = NewUser {
                username: username.as_str(),
                created_at: time,
                modified_at: time,
            };

            Ok(db.create_user(new_user)?)
        }
        1 => {
            // There is only one user in the DB, assume it is the new default
            let user = users.remove(0);
            info!(
                configured = %username,
                adopted = %user.username,
                "configured user not found, using the only user in the catalog"
            );
            Config::update(Config {
                local_username: user.username.clone(),
                ..config.clone()
            });
            manager
                .write_to_file()
                .context("Unable to update the config file")?;

            Ok(user)
        }
        _ => {
            let names: Vec<&str> = users.iter().map(|u| u.username.as_str()).collect();
            bail!(
                "User \"{}\" does not exist. Set local_username in \"{}\" to one of: {}",
                username,
                manager.path().display(),
                names.join(", ")
            )
        }
    }
}
