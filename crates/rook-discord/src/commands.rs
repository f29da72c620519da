//! Slash command registration from the live command table.
//!
//! `"reminders list"` becomes the `list` subcommand of `/reminders`; a
//! three-word name becomes a subcommand inside a group.

use std::{collections::BTreeMap, sync::Arc};

use serenity::all::{CommandOptionType, CreateCommand, CreateCommandOption, Http};

use rook_core::command::{Command, Param};

const DESCRIPTION_LIMIT: usize = 100;

fn describe(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return "No description".to_string();
    }
    text.chars().take(DESCRIPTION_LIMIT).collect()
}

fn option_kind(type_name: &str) -> CommandOptionType {
    match type_name {
        "integer" | "int" => CommandOptionType::Integer,
        "number" | "float" => CommandOptionType::Number,
        "boolean" | "bool" => CommandOptionType::Boolean,
        "user" | "member" => CommandOptionType::User,
        "channel" => CommandOptionType::Channel,
        "role" => CommandOptionType::Role,
        _ => CommandOptionType::String,
    }
}

fn param_option(p: &Param) -> CreateCommandOption {
    CreateCommandOption::new(
        option_kind(p.type_name()),
        p.name(),
        describe(p.description().unwrap_or(p.name())),
    )
    .required(p.is_required())
}

fn leaf(kind: CommandOptionType, name: &str, cmd: &Command) -> CreateCommandOption {
    cmd.params()
        .iter()
        .fold(
            CreateCommandOption::new(kind, name, describe(cmd.description())),
            |opt, p| opt.add_sub_option(param_option(p)),
        )
}

#[derive(Default)]
struct Node<'a> {
    command: Option<&'a Command>,
    children: BTreeMap<&'a str, Node<'a>>,
}

/// Build the global command set. Hidden commands are not exposed.
pub fn build(commands: &[Arc<Command>]) -> Vec<CreateCommand> {
    let mut roots: BTreeMap<&str, Node<'_>> = BTreeMap::new();
    for cmd in commands.iter().filter(|c| !c.is_hidden()) {
        let mut words = cmd.name().split(' ');
        let Some(first) = words.next() else { continue };
        let mut node = roots.entry(first).or_default();
        for word in words {
            node = node.children.entry(word).or_default();
        }
        node.command = Some(cmd.as_ref());
    }

    roots
        .into_iter()
        .map(|(name, node)| {
            if node.children.is_empty() {
                let base = CreateCommand::new(name)
                    .description(describe(node.command.map(|c| c.description()).unwrap_or("")));
                return match node.command {
                    Some(cmd) => cmd
                        .params()
                        .iter()
                        .fold(base, |c, p| c.add_option(param_option(p))),
                    None => base,
                };
            }

            let description = describe(node.command.map(|c| c.description()).unwrap_or(name));
            node.children.iter().fold(
                CreateCommand::new(name).description(description),
                |root, (sub, child)| {
                    let opt = if child.children.is_empty() {
                        child.command.map(|c| leaf(CommandOptionType::SubCommand, sub, c))
                    } else {
                        let group = CreateCommandOption::new(
                            CommandOptionType::SubCommandGroup,
                            *sub,
                            describe(child.command.map(|c| c.description()).unwrap_or(*sub)),
                        );
                        Some(child.children.iter().fold(group, |g, (leaf_name, n)| match n.command {
                            Some(c) => g.add_sub_option(leaf(CommandOptionType::SubCommand, leaf_name, c)),
                            None => g,
                        }))
                    };
                    match opt {
                        Some(o) => root.add_option(o),
                        None => root,
                    }
                },
            )
        })
        .collect()
}

/// Replace the application's global commands. Returns how many were registered.
pub async fn sync(http: &Http, commands: &[Arc<Command>]) -> serenity::Result<usize> {
    let built = build(commands);
    let registered = serenity::all::Command::set_global_commands(http, built).await?;
    Ok(registered.len())
}
