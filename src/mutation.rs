//! User edits to a grouping state.
//!
//! Every action is applied to a copy of the state. On success the copy's
//! counts are recomputed and re-validated and the copy is returned; on error
//! the copy is dropped, so a failed action never changes anything.

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::{
    GroupingError, GroupingState, Item, ItemLocation, OptionExt, Result, NEW_GROUP_SUB_GROUP_NAME,
};

/// Where moved items go.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Destination {
    /// A specific sub-group
    SubGroup { group_id: String, sub_group_id: String },
    /// A main group's ungrouped sub-group; `None` means the item's current
    /// main group
    MainGroupUngrouped { group_id: Option<String> },
    /// The dataset-level ungrouped bucket
    Ungrouped,
}

/// A typed user edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Action {
    AddMainGroup { name: String },
    DeleteMainGroup { group_id: String },
    RenameMainGroup { group_id: String, name: String },
    AddSubGroup { group_id: String, name: String },
    DeleteSubGroup { group_id: String, sub_group_id: String },
    RenameSubGroup { group_id: String, sub_group_id: String, name: String },
    MoveItem { item_id: String, destination: Destination },
    MoveItems { item_ids: Vec<String>, destination: Destination },
    /// Flip the flag, or set it when `enabled` is given
    ToggleMainGroup { group_id: String, enabled: Option<bool> },
    RemoveItem { group_id: String, sub_group_id: String, item_id: String },
}

impl Action {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Action::AddMainGroup { .. } => "add_main_group",
            Action::DeleteMainGroup { .. } => "delete_main_group",
            Action::RenameMainGroup { .. } => "rename_main_group",
            Action::AddSubGroup { .. } => "add_sub_group",
            Action::DeleteSubGroup { .. } => "delete_sub_group",
            Action::RenameSubGroup { .. } => "rename_sub_group",
            Action::MoveItem { .. } => "move_item",
            Action::MoveItems { .. } => "move_items",
            Action::ToggleMainGroup { .. } => "toggle_main_group",
            Action::RemoveItem { .. } => "remove_item",
        }
    }
}

// ============================================================================
// Wire form
// ============================================================================

/// Target id meaning the dataset-level ungrouped bucket.
pub const TARGET_UNGROUPED: &str = "ungrouped";

/// Target id meaning a main group's ungrouped sub-group.
pub const TARGET_MAIN_GROUP_UNGROUPED: &str = "main_group_ungrouped";

/// Loosely-typed update request as sent by a front end.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationRequest {
    pub action: String,
    pub group_id: Option<String>,
    pub sub_group_id: Option<String>,
    pub item_id: Option<String>,
    pub item_ids: Option<Vec<String>>,
    /// A main group id, `ungrouped` or `main_group_ungrouped`
    pub target_group_id: Option<String>,
    pub target_sub_group_id: Option<String>,
    /// Main group for `main_group_ungrouped` targets
    pub main_group_id: Option<String>,
    pub name: Option<String>,
    pub enabled: Option<bool>,
}

fn required(value: Option<String>, field: &str, action: &str) -> Result<String> {
    value
        .filter(|v| !v.is_empty())
        .ok_or_else(|| GroupingError::MalformedAction(format!("'{}' requires '{}'", action, field)))
}

impl MutationRequest {
    fn destination(&mut self) -> Result<Destination> {
        let action = self.action.clone();
        let target = required(self.target_group_id.take(), "target_group_id", &action)?;
        Ok(match target.as_str() {
            TARGET_UNGROUPED => Destination::Ungrouped,
            TARGET_MAIN_GROUP_UNGROUPED => Destination::MainGroupUngrouped {
                group_id: self.main_group_id.take(),
            },
            _ => Destination::SubGroup {
                group_id: target,
                sub_group_id: required(self.target_sub_group_id.take(), "target_sub_group_id", &action)?,
            },
        })
    }
}

impl TryFrom<MutationRequest> for Action {
    type Error = GroupingError;

    fn try_from(mut req: MutationRequest) -> Result<Self> {
        let action = req.action.trim().to_string();
        let a = action.as_str();
        let parsed = match a {
            "add_main_group" | "add_group" => Action::AddMainGroup {
                name: required(req.name, "name", a)?,
            },
            "delete_main_group" | "delete_group" => Action::DeleteMainGroup {
                group_id: required(req.group_id, "group_id", a)?,
            },
            "rename_main_group" | "update_group_name" => Action::RenameMainGroup {
                group_id: required(req.group_id, "group_id", a)?,
                name: required(req.name, "name", a)?,
            },
            "add_sub_group" => Action::AddSubGroup {
                group_id: required(req.group_id, "group_id", a)?,
                name: required(req.name, "name", a)?,
            },
            "delete_sub_group" => Action::DeleteSubGroup {
                group_id: required(req.group_id, "group_id", a)?,
                sub_group_id: required(req.sub_group_id, "sub_group_id", a)?,
            },
            "rename_sub_group" | "update_sub_group_name" => Action::RenameSubGroup {
                group_id: required(req.group_id, "group_id", a)?,
                sub_group_id: required(req.sub_group_id, "sub_group_id", a)?,
                name: required(req.name, "name", a)?,
            },
            "move_item" => {
                let destination = req.destination()?;
                Action::MoveItem {
                    item_id: required(req.item_id, "item_id", a)?,
                    destination,
                }
            }
            "move_items" | "move_multiple_items" => {
                let destination = req.destination()?;
                let item_ids = req.item_ids.filter(|ids| !ids.is_empty()).ok_or_else(|| {
                    GroupingError::MalformedAction(format!("'{}' requires 'item_ids'", a))
                })?;
                Action::MoveItems { item_ids, destination }
            }
            "toggle_group" | "toggle_main_group" => Action::ToggleMainGroup {
                group_id: required(req.group_id, "group_id", a)?,
                enabled: req.enabled,
            },
            "remove_item" | "remove_from_sub_group" => Action::RemoveItem {
                group_id: required(req.group_id, "group_id", a)?,
                sub_group_id: required(req.sub_group_id, "sub_group_id", a)?,
                item_id: required(req.item_id, "item_id", a)?,
            },
            other => {
                return Err(GroupingError::MalformedAction(format!(
                    "unknown action '{}'",
                    other
                )))
            }
        };
        Ok(parsed)
    }
}

// ============================================================================
// Application
// ============================================================================

/// Apply `action` to a copy of `state` and return the updated copy.
pub fn apply_action(state: &GroupingState, action: &Action) -> Result<GroupingState> {
    let mut next = state.clone();
    apply_in_place(&mut next, action)?;
    next.refresh();
    next.metadata.updated_at = Utc::now();
    log::debug!(
        "[Mutation] {} on '{}': {} grouped / {} ungrouped rows",
        action.kind(),
        next.dataset_id,
        next.validation.counts.grouped_records,
        next.validation.counts.ungrouped_records
    );
    Ok(next)
}

fn checked_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(GroupingError::InvalidName("name must not be blank".to_string()));
    }
    Ok(trimmed.to_string())
}

fn ensure_unique_sub_name(
    state: &GroupingState,
    group_idx: usize,
    name: &str,
    except: Option<&str>,
) -> Result<()> {
    let group = &state.main_groups[group_idx];
    let taken = group
        .sub_groups
        .iter()
        .filter(|sg| Some(sg.id.as_str()) != except)
        .any(|sg| sg.name.eq_ignore_ascii_case(name));
    if taken {
        return Err(GroupingError::DuplicateName {
            group_id: group.id.clone(),
            name: name.to_string(),
        });
    }
    Ok(())
}

fn sub_group_index(state: &GroupingState, group_idx: usize, sub_group_id: &str) -> Result<usize> {
    let group = &state.main_groups[group_idx];
    group
        .sub_groups
        .iter()
        .position(|sg| sg.id == sub_group_id)
        .ok_or_unknown_sub_group(&group.id, sub_group_id)
}

fn group_index(state: &GroupingState, group_id: &str) -> Result<usize> {
    state.group_index(group_id).ok_or_unknown_group(group_id)
}

/// Main group id of an item's current location, if it is in one.
fn source_group_id(state: &GroupingState, location: ItemLocation) -> Option<String> {
    match location {
        ItemLocation::SubGroup(gi, _, _) => Some(state.main_groups[gi].id.clone()),
        ItemLocation::Ungrouped(_) => None,
    }
}

/// Check a destination exists before anything is moved.
fn check_destination(state: &GroupingState, destination: &Destination) -> Result<()> {
    match destination {
        Destination::SubGroup { group_id, sub_group_id } => {
            let gi = group_index(state, group_id)?;
            sub_group_index(state, gi, sub_group_id).map(|_| ())
        }
        Destination::MainGroupUngrouped { group_id: Some(group_id) } => {
            group_index(state, group_id).map(|_| ())
        }
        Destination::MainGroupUngrouped { group_id: None } | Destination::Ungrouped => Ok(()),
    }
}

fn place_item(
    state: &mut GroupingState,
    item: Item,
    destination: &Destination,
    source_group: Option<String>,
) -> Result<()> {
    match destination {
        Destination::Ungrouped => state.ungrouped.items.push(item),
        Destination::SubGroup { group_id, sub_group_id } => {
            let gi = group_index(state, group_id)?;
            let si = sub_group_index(state, gi, sub_group_id)?;
            state.main_groups[gi].sub_groups[si].items.push(item);
        }
        Destination::MainGroupUngrouped { group_id } => {
            let group_id = group_id.clone().or(source_group).ok_or_else(|| {
                GroupingError::MalformedAction(format!(
                    "item '{}' is not in a main group; name the target main group",
                    item.id
                ))
            })?;
            let gi = group_index(state, &group_id)?;
            let si = state.ensure_ungrouped_sub_group(gi);
            state.main_groups[gi].sub_groups[si].items.push(item);
        }
    }
    Ok(())
}

fn move_item(state: &mut GroupingState, item_id: &str, destination: &Destination) -> Result<()> {
    let location = state
        .locate_item(item_id)
        .ok_or_else(|| GroupingError::UnknownItem(item_id.to_string()))?;
    let source_group = source_group_id(state, location);
    let item = state.take_item(location);
    place_item(state, item, destination, source_group)
}

fn apply_in_place(state: &mut GroupingState, action: &Action) -> Result<()> {
    match action {
        Action::AddMainGroup { name } => {
            let name = checked_name(name)?;
            let gi = state.push_group(&name);
            state.push_sub_group(gi, NEW_GROUP_SUB_GROUP_NAME);
        }

        Action::DeleteMainGroup { group_id } => {
            let gi = group_index(state, group_id)?;
            let group = state.main_groups.remove(gi);
            for sub in group.sub_groups {
                state.ungrouped.items.extend(sub.items);
                state.ungrouped.elided.absorb(sub.elided);
            }
        }

        Action::RenameMainGroup { group_id, name } => {
            let name = checked_name(name)?;
            let gi = group_index(state, group_id)?;
            state.main_groups[gi].name = name;
        }

        Action::AddSubGroup { group_id, name } => {
            let name = checked_name(name)?;
            let gi = group_index(state, group_id)?;
            ensure_unique_sub_name(state, gi, &name, None)?;
            state.push_sub_group(gi, &name);
        }

        Action::DeleteSubGroup { group_id, sub_group_id } => {
            let gi = group_index(state, group_id)?;
            let si = sub_group_index(state, gi, sub_group_id)?;
            if state.main_groups[gi].sub_groups[si].is_ungrouped {
                return Err(GroupingError::ProtectedSubGroup(sub_group_id.clone()));
            }
            let removed = state.main_groups[gi].sub_groups.remove(si);
            let ui = state.ensure_ungrouped_sub_group(gi);
            let target = &mut state.main_groups[gi].sub_groups[ui];
            target.items.extend(removed.items);
            target.elided.absorb(removed.elided);
        }

        Action::RenameSubGroup { group_id, sub_group_id, name } => {
            let name = checked_name(name)?;
            let gi = group_index(state, group_id)?;
            let si = sub_group_index(state, gi, sub_group_id)?;
            ensure_unique_sub_name(state, gi, &name, Some(sub_group_id))?;
            state.main_groups[gi].sub_groups[si].name = name;
        }

        Action::MoveItem { item_id, destination } => {
            check_destination(state, destination)?;
            move_item(state, item_id, destination)?;
        }

        Action::MoveItems { item_ids, destination } => {
            check_destination(state, destination)?;
            for item_id in item_ids {
                move_item(state, item_id, destination)?;
            }
        }

        Action::ToggleMainGroup { group_id, enabled } => {
            let gi = group_index(state, group_id)?;
            let group = &mut state.main_groups[gi];
            group.enabled = enabled.unwrap_or(!group.enabled);
        }

        Action::RemoveItem { group_id, sub_group_id, item_id } => {
            let gi = group_index(state, group_id)?;
            let si = sub_group_index(state, gi, sub_group_id)?;
            let sub = &mut state.main_groups[gi].sub_groups[si];
            let ii = sub
                .items
                .iter()
                .position(|i| i.id == *item_id)
                .ok_or_else(|| GroupingError::UnknownItem(item_id.clone()))?;
            let from_ungrouped = sub.is_ungrouped;
            let item = sub.items.remove(ii);
            if from_ungrouped {
                state.ungrouped.items.push(item);
            } else {
                let ui = state.ensure_ungrouped_sub_group(gi);
                state.main_groups[gi].sub_groups[ui].items.push(item);
            }
        }
    }
    Ok(())
}
