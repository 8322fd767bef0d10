//! CLI handlers for `rfidisk tag` subcommands.
//!
//! Implements:
//! - `rfidisk tag list`    -- list all tags in table format
//! - `rfidisk tag show`    -- show one tag's entry
//! - `rfidisk tag set`     -- create or edit an entry
//! - `rfidisk tag remove`  -- delete an entry
//! - `rfidisk tag test`    -- launch an entry's command, then terminate it

use std::time::Duration;

use anyhow::{Context, Result, bail};

use rfidisk_core::registry::DISPLAY_LINE_LIMITS;
use rfidisk_core::{IconType, ProcessSupervisor, Supervisor, TagEntry, TagId, TagRegistry};

use crate::TagCommands;
use crate::config::RfidiskConfig;

// -----------------------------------------------------------------------
// Public entry point
// -----------------------------------------------------------------------

/// Dispatch a `TagCommands` variant to the appropriate handler.
pub async fn run_tag_command(command: TagCommands, config: &RfidiskConfig) -> Result<()> {
    let registry = TagRegistry::open(&config.tags_path)
        .with_context(|| format!("failed to load tag store {}", config.tags_path.display()))?;

    match command {
        TagCommands::List => cmd_list(&registry),
        TagCommands::Show { tag } => cmd_show(&registry, &parse_tag(&tag)?),
        TagCommands::Set {
            tag,
            command,
            terminate,
            line1,
            line2,
            line3,
            line4,
        } => cmd_set(
            &registry,
            &parse_tag(&tag)?,
            EntryEdits {
                command,
                terminate,
                lines: [line1, line2, line3, line4],
            },
        ),
        TagCommands::Remove { tag } => cmd_remove(&registry, &parse_tag(&tag)?),
        TagCommands::Test { tag, seconds } => {
            let supervisor = ProcessSupervisor::new(config.supervisor.clone());
            cmd_test(&registry, &supervisor, &parse_tag(&tag)?, Duration::from_secs(seconds)).await
        }
    }
}

fn parse_tag(raw: &str) -> Result<TagId> {
    TagId::parse(raw).with_context(|| format!("invalid tag id {raw:?}"))
}

// -----------------------------------------------------------------------
// rfidisk tag list
// -----------------------------------------------------------------------

fn cmd_list(registry: &TagRegistry) -> Result<()> {
    let entries = registry.list();
    if entries.is_empty() {
        println!(
            "No tags in {}. Insert a tag or use `rfidisk tag set` to add one.",
            registry.path().display()
        );
        return Ok(());
    }
    print!("{}", render_table(&entries));
    Ok(())
}

/// Fixed-width table of entries, one per line.
fn render_table(entries: &[TagEntry]) -> String {
    let id_w = entries
        .iter()
        .map(|e| e.id.as_str().len())
        .max()
        .unwrap_or(3)
        .max(3);
    let title_w = entries
        .iter()
        .map(|e| e.line1.chars().count())
        .max()
        .unwrap_or(5)
        .max(5);

    let mut out = format!("{:<id_w$}  {:<title_w$}  {:<6}  COMMAND\n", "TAG", "TITLE", "ICON");
    for entry in entries {
        let command = if entry.has_command() {
            entry.command.as_str()
        } else {
            "(display only)"
        };
        out.push_str(&format!(
            "{:<id_w$}  {:<title_w$}  {:<6}  {}\n",
            entry.id.as_str(),
            entry.line1,
            icon_label(IconType::for_command(&entry.command)),
            command,
        ));
    }
    out
}

fn icon_label(icon: IconType) -> &'static str {
    match icon {
        IconType::None => "-",
        IconType::Floppy => "floppy",
        IconType::Steam => "steam",
    }
}

// -----------------------------------------------------------------------
// rfidisk tag show
// -----------------------------------------------------------------------

fn cmd_show(registry: &TagRegistry, tag: &TagId) -> Result<()> {
    let entry = registry
        .get(tag)
        .with_context(|| format!("no entry for tag {tag}"))?;

    println!("Tag:        {}", entry.id);
    println!("Command:    {}", entry.command);
    if entry.has_terminate_command() {
        println!("Terminate:  {}", entry.terminate);
    }
    println!("Line 1:     {}", entry.line1);
    println!("Line 2:     {}", entry.line2);
    println!("Line 3:     {}", entry.line3);
    println!("Line 4:     {}", entry.line4);
    println!("Display:    {}", rfidisk_core::codec::encode(&entry.display_frame()));
    if entry.is_stub() {
        println!();
        println!("This is an unconfigured placeholder. Use `rfidisk tag set {tag}` to edit it.");
    }
    Ok(())
}

// -----------------------------------------------------------------------
// rfidisk tag set
// -----------------------------------------------------------------------

/// Fields given on the command line. `None` leaves the field unchanged.
#[derive(Debug, Default)]
struct EntryEdits {
    command: Option<String>,
    terminate: Option<String>,
    lines: [Option<String>; 4],
}

impl EntryEdits {
    fn apply(self, entry: &mut TagEntry) {
        if let Some(command) = self.command {
            entry.command = command;
        }
        if let Some(terminate) = self.terminate {
            entry.terminate = terminate;
        }
        let [line1, line2, line3, line4] = self.lines;
        for (field, value) in [
            (&mut entry.line1, line1),
            (&mut entry.line2, line2),
            (&mut entry.line3, line3),
            (&mut entry.line4, line4),
        ] {
            if let Some(value) = value {
                *field = value;
            }
        }
    }
}

fn cmd_set(registry: &TagRegistry, tag: &TagId, edits: EntryEdits) -> Result<()> {
    let existing = registry.get(tag);
    let created = existing.is_none();
    let mut entry = existing.unwrap_or_else(|| TagEntry::stub(tag.clone()));
    edits.apply(&mut entry);

    let lines = [&entry.line1, &entry.line2, &entry.line3, &entry.line4];
    for (i, (line, limit)) in lines.iter().zip(DISPLAY_LINE_LIMITS).enumerate() {
        if line.chars().count() > limit {
            eprintln!(
                "note: line {} is longer than {limit} characters and will be truncated on the display",
                i + 1
            );
        }
    }

    registry.save(entry)?;
    if created {
        println!("Tag {tag} added.");
    } else {
        println!("Tag {tag} updated.");
    }
    Ok(())
}

// -----------------------------------------------------------------------
// rfidisk tag remove
// -----------------------------------------------------------------------

fn cmd_remove(registry: &TagRegistry, tag: &TagId) -> Result<()> {
    if !registry.remove(tag)? {
        bail!("no entry for tag {tag}");
    }
    println!("Tag {tag} removed.");
    Ok(())
}

// -----------------------------------------------------------------------
// rfidisk tag test
// -----------------------------------------------------------------------

async fn cmd_test(
    registry: &TagRegistry,
    supervisor: &dyn Supervisor,
    tag: &TagId,
    run_for: Duration,
) -> Result<()> {
    let entry = registry
        .get(tag)
        .with_context(|| format!("no entry for tag {tag}"))?;
    if !entry.has_command() {
        bail!("tag {tag} has no command to launch");
    }

    println!("Launching: {}", entry.command);
    let handle = supervisor
        .launch(&entry.command)
        .await
        .with_context(|| format!("failed to launch {:?}", entry.command))?;
    println!("  pid: {}", handle.root_pid);

    println!("Running for {}s (Ctrl+C to stop early)...", run_for.as_secs());
    tokio::select! {
        _ = tokio::time::sleep(run_for) => {}
        _ = tokio::signal::ctrl_c() => println!(),
    }

    let alive = supervisor.is_alive(&handle).await;
    if !alive {
        println!("Application already exited.");
    }

    if entry.has_terminate_command() {
        println!("Terminating with: {}", entry.terminate);
    } else {
        println!("Terminating process tree...");
    }
    supervisor
        .terminate(&handle, &entry.terminate)
        .await
        .context("termination failed")?;
    println!("Done.");
    Ok(())
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
