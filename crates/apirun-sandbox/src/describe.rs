//! Command discovery over a script's default export.

use rquickjs::convert::Coerced;
use rquickjs::{Object, Value};

use crate::CommandDescriptor;

/// List every enumerable own property of `default` as a command.
///
/// Never calls `run`. Null or undefined entries are skipped; missing `desc`
/// and `args` yield empty values.
pub(crate) fn describe_commands<'js>(default: &Object<'js>) -> rquickjs::Result<Vec<CommandDescriptor>> {
    let mut commands = Vec::new();
    for key in default.keys::<String>() {
        let name = key?;
        let entry: Value = default.get(name.as_str())?;
        if entry.is_undefined() || entry.is_null() {
            continue;
        }
        let (description, args) = match entry.as_object() {
            Some(obj) => (read_description(obj)?, read_args(obj)?),
            None => (String::new(), Vec::new()),
        };
        commands.push(CommandDescriptor {
            name,
            description,
            args,
        });
    }
    Ok(commands)
}

fn read_description(command: &Object<'_>) -> rquickjs::Result<String> {
    let desc: Value = command.get("desc")?;
    if desc.is_undefined() || desc.is_null() {
        return Ok(String::new());
    }
    Ok(desc.get::<Coerced<String>>()?.0)
}

fn read_args(command: &Object<'_>) -> rquickjs::Result<Vec<String>> {
    let args: Value = command.get("args")?;
    let Some(array) = args.as_array() else {
        return Ok(Vec::new());
    };
    array
        .iter::<Coerced<String>>()
        .map(|item| item.map(|s| s.0))
        .collect()
}
