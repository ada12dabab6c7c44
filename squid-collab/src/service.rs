//! Mutation orchestration: authorize, persist, broadcast.
//!
//! ```text
//! handler ──► BoardService ──► ProjectDirectory (role check)
//!                   │
//!                   ├──► OrderCoordinator ──► BoardStore (one atomic batch)
//!                   │
//!                   └──► BroadcastHub ──► live connections of the project
//! ```
//!
//! Authorization failures stop before any write; write failures stop before
//! any broadcast. The request deadline covers authorization and the write.
//! Broadcasting happens after the commit and never turns a committed
//! mutation into an error. The scope a mutation locked stays locked until
//! its event is out.
//!
//! Parents are checked again once their child scope is held: a column's
//! project, a row's column, a label being attached, and the row a comment or
//! checklist hangs off.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::auth::{ProjectAuthSet, ProjectDirectory, Role, StoreDirectory};
use crate::broadcast::BroadcastHub;
use crate::error::{BoardError, BoardResult, Entity};
use crate::model::{
    now_secs, Checklist, ChecklistId, Column, ColumnBody, ColumnId, Comment, CommentId,
    CommentSection, CommentSectionId, ItemBody, Label, LabelId, LabelTarget, OrderedItem, Point,
    PointId, Priority, Project, ProjectId, Row, RowBody, RowId, ScopeKind, ScopeRef, UserId,
};
use crate::order::{OrderCoordinator, OrderOutcome, ScopeGuard};
use crate::protocol::{Event, EventType};
use crate::registry::ConnectionRegistry;
use crate::storage::{BoardStore, WriteOp, WriteSet};

// ─── Requests ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProject {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub admin_ids: Vec<UserId>,
    #[serde(default)]
    pub member_ids: Vec<UserId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub admin_ids: Option<Vec<UserId>>,
    pub member_ids: Option<Vec<UserId>>,
}

impl ProjectChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.admin_ids.is_none()
            && self.member_ids.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewColumn {
    pub project_id: ProjectId,
    pub name: String,
    pub order: i64,
    pub label_id: Option<LabelId>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ColumnChanges {
    pub name: Option<String>,
    pub label_id: Option<LabelId>,
    pub order: Option<i64>,
}

impl ColumnChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.label_id.is_none() && self.order.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewRow {
    pub column_id: ColumnId,
    pub name: String,
    pub description: Option<String>,
    pub order: i64,
    pub priority: Option<Priority>,
    pub label_id: Option<LabelId>,
    #[serde(default)]
    pub assignee_ids: Vec<UserId>,
    pub due_date: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RowChanges {
    pub name: Option<String>,
    pub description: Option<String>,
    pub order: Option<i64>,
    pub priority: Option<Priority>,
    pub label_id: Option<LabelId>,
    pub assignee_ids: Option<Vec<UserId>>,
    pub due_date: Option<u64>,
}

impl RowChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none()
            && self.description.is_none()
            && self.order.is_none()
            && self.priority.is_none()
            && self.label_id.is_none()
            && self.assignee_ids.is_none()
            && self.due_date.is_none()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewLabel {
    pub project_id: ProjectId,
    pub target: LabelTarget,
    pub name: String,
    pub color: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct LabelChanges {
    pub name: Option<String>,
    pub color: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewPoint {
    pub checklist_id: ChecklistId,
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PointChanges {
    pub name: Option<String>,
    pub description: Option<String>,
}

impl PointChanges {
    pub fn is_empty(&self) -> bool {
        self.name.is_none() && self.description.is_none()
    }
}

// ─── Responses ────────────────────────────────────────────────────────

/// A column mutation and the project's full column list after it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ColumnChange {
    pub column: Column,
    pub columns: Vec<Column>,
}

/// A row mutation and the column's full row list after it.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RowChange {
    pub row: Row,
    pub rows: Vec<Row>,
}

/// The operations HTTP handlers call.
pub struct BoardService {
    store: Arc<dyn BoardStore>,
    order: OrderCoordinator<dyn BoardStore>,
    directory: Arc<dyn ProjectDirectory>,
    hub: Arc<BroadcastHub>,
    request_timeout: Duration,
}

impl BoardService {
    pub fn new(
        store: Arc<dyn BoardStore>,
        registry: Arc<ConnectionRegistry>,
        request_timeout: Duration,
    ) -> Self {
        let directory: Arc<dyn ProjectDirectory> = Arc::new(StoreDirectory::new(store.clone()));
        let hub = Arc::new(BroadcastHub::new(directory.clone(), registry));
        Self {
            order: OrderCoordinator::new(store.clone()),
            store,
            directory,
            hub,
            request_timeout,
        }
    }

    pub fn hub(&self) -> &Arc<BroadcastHub> {
        &self.hub
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        self.hub.registry()
    }

    pub fn store(&self) -> &Arc<dyn BoardStore> {
        &self.store
    }

    // ─── Projects ─────────────────────────────────────────────────────

    pub async fn create_project(&self, user: UserId, req: NewProject) -> BoardResult<Project> {
        let project = self
            .bounded(async {
                let name = required_text("name", req.name)?;
                check_roles(user, &req.admin_ids, &req.member_ids)?;
                let now = now_secs();
                let project = Project {
                    id: uuid::Uuid::new_v4(),
                    name,
                    description: req.description,
                    creator_id: user,
                    admin_ids: req.admin_ids,
                    member_ids: req.member_ids,
                    created_at: now,
                    updated_at: now,
                };
                self.commit_one(WriteOp::PutProject(project.clone()))?;
                log::info!("Project {} created by {user}", project.id);
                Ok(project)
            })
            .await?;

        self.announce(project.id, EventType::ProjectCreated, "project created", &project)
            .await;
        Ok(project)
    }

    pub async fn get_project(&self, user: UserId, project_id: ProjectId) -> BoardResult<Project> {
        self.bounded(async {
            self.authorize(project_id, user, Role::Member)?;
            self.load_project(project_id)
        })
        .await
    }

    /// Projects the user participates in.
    pub async fn list_projects(&self, user: UserId) -> BoardResult<Vec<Project>> {
        self.bounded(async { Ok(self.store.list_projects_for(user)?) })
            .await
    }

    pub async fn update_project(
        &self,
        user: UserId,
        project_id: ProjectId,
        changes: ProjectChanges,
    ) -> BoardResult<Project> {
        if changes.is_empty() {
            return Err(BoardError::bad_request("nothing to update"));
        }
        let project = self
            .bounded(async {
                self.authorize(project_id, user, Role::Admin)?;
                let mut project = self.load_project(project_id)?;
                if let Some(name) = changes.name {
                    project.name = required_text("name", name)?;
                }
                if let Some(description) = changes.description {
                    project.description = Some(description);
                }
                if let Some(admins) = changes.admin_ids {
                    project.admin_ids = admins;
                }
                if let Some(members) = changes.member_ids {
                    project.member_ids = members;
                }
                check_roles(project.creator_id, &project.admin_ids, &project.member_ids)?;
                project.updated_at = now_secs();
                self.commit_one(WriteOp::PutProject(project.clone()))?;
                Ok(project)
            })
            .await?;

        self.announce(project.id, EventType::ProjectUpdated, "project updated", &project)
            .await;
        Ok(project)
    }

    /// Delete a project with its columns, rows, labels and comments.
    ///
    /// Everyone who could see the project before the delete is notified.
    pub async fn delete_project(&self, user: UserId, project_id: ProjectId) -> BoardResult<Project> {
        let (project, audience, guards) = self
            .bounded(async {
                let audience = self.authorize(project_id, user, Role::Creator)?;
                let project = self.load_project(project_id)?;
                let (guards, _) = self.lock_project_scopes(project_id).await?;
                self.commit_one(WriteOp::DeleteProject(project_id))?;
                log::info!("Project {project_id} deleted by {user}");
                Ok((project, audience, guards))
            })
            .await?;

        match serde_json::to_value(&project) {
            Ok(payload) => {
                let event = Event::new(EventType::ProjectDeleted, "project deleted", payload);
                self.hub.publish_to(&audience, event).await;
            }
            Err(e) => log::error!("Could not encode deleted project {project_id}: {e}"),
        }
        drop(guards);
        Ok(project)
    }

    // ─── Columns ──────────────────────────────────────────────────────

    pub async fn create_column(&self, user: UserId, req: NewColumn) -> BoardResult<ColumnChange> {
        let project_id = req.project_id;
        let label_id = req.label_id;
        let committed = self
            .bounded(async {
                self.authorize(project_id, user, Role::Admin)?;
                let name = required_text("name", req.name)?;
                let item = OrderedItem::new(
                    ScopeRef::columns_of(project_id),
                    ItemBody::Column(ColumnBody { name, label_id }),
                );
                self.order
                    .insert_held(item, req.order, WriteSet::new(), || {
                        self.load_project(project_id)?;
                        self.check_label(project_id, label_id, LabelTarget::Column)
                    })
                    .await
            })
            .await?;

        let change = column_change(&committed.outcome)?;
        self.announce(project_id, EventType::ColumnCreated, "column created", &change.columns)
            .await;
        drop(committed);
        Ok(change)
    }

    /// Rename, relabel and/or move a column in one step.
    pub async fn update_column(
        &self,
        user: UserId,
        column_id: ColumnId,
        changes: ColumnChanges,
    ) -> BoardResult<ColumnChange> {
        if changes.is_empty() {
            return Err(BoardError::bad_request("nothing to update"));
        }
        let (project_id, committed) = self
            .bounded(async {
                let column = self.load_item(ScopeKind::Columns, column_id)?;
                let project_id = column.scope_id;
                self.authorize(project_id, user, Role::Admin)?;
                let name = changes
                    .name
                    .map(|n| required_text("name", n))
                    .transpose()?;
                let label_id = changes.label_id;

                let committed = self
                    .order
                    .update_held(column.scope(), column_id, changes.order, |body| {
                        self.check_label(project_id, label_id, LabelTarget::Column)?;
                        if let ItemBody::Column(c) = body {
                            if let Some(name) = name {
                                c.name = name;
                            }
                            if label_id.is_some() {
                                c.label_id = label_id;
                            }
                        }
                        Ok(())
                    })
                    .await?;
                Ok((project_id, committed))
            })
            .await?;

        let change = column_change(&committed.outcome)?;
        self.announce(project_id, EventType::ColumnUpdated, "column updated", &change.columns)
            .await;
        drop(committed);
        Ok(change)
    }

    pub async fn move_column(
        &self,
        user: UserId,
        column_id: ColumnId,
        new_order: i64,
    ) -> BoardResult<ColumnChange> {
        let changes = ColumnChanges {
            order: Some(new_order),
            ..ColumnChanges::default()
        };
        self.update_column(user, column_id, changes).await
    }

    /// Delete a column and its rows; later columns move up by one.
    pub async fn delete_column(&self, user: UserId, column_id: ColumnId) -> BoardResult<ColumnChange> {
        let (project_id, committed) = self
            .bounded(async {
                let column = self.load_item(ScopeKind::Columns, column_id)?;
                let project_id = column.scope_id;
                self.authorize(project_id, user, Role::Admin)?;
                let committed = self
                    .order
                    .delete_held(column.scope(), column_id, WriteSet::new())
                    .await?;
                Ok((project_id, committed))
            })
            .await?;

        let change = column_change(&committed.outcome)?;
        self.announce(project_id, EventType::ColumnDeleted, "column deleted", &change.columns)
            .await;
        drop(committed);
        Ok(change)
    }

    pub async fn list_columns(&self, user: UserId, project_id: ProjectId) -> BoardResult<Vec<Column>> {
        self.bounded(async {
            self.authorize(project_id, user, Role::Member)?;
            let items = self.order.list(ScopeRef::columns_of(project_id))?;
            Ok(items.iter().filter_map(Column::from_item).collect())
        })
        .await
    }

    // ─── Rows ─────────────────────────────────────────────────────────

    /// Create a row together with its comment section.
    pub async fn create_row(&self, user: UserId, req: NewRow) -> BoardResult<RowChange> {
        let column_id = req.column_id;
        let label_id = req.label_id;
        let (project_id, committed) = self
            .bounded(async {
                let column = self.load_item(ScopeKind::Columns, column_id)?;
                let project_id = column.scope_id;
                let auth = self.authorize(project_id, user, Role::Admin)?;
                let name = required_text("name", req.name)?;
                check_assignees(&auth, &req.assignee_ids)?;

                let section_id: CommentSectionId = uuid::Uuid::new_v4();
                let item = OrderedItem::new(
                    ScopeRef::rows_of(column_id),
                    ItemBody::Row(RowBody {
                        name,
                        description: req.description,
                        creator_id: user,
                        priority: req.priority,
                        label_id,
                        assignee_ids: req.assignee_ids,
                        due_date: req.due_date,
                        comment_section_id: section_id,
                    }),
                );
                let mut extra = WriteSet::new();
                extra.push(WriteOp::PutCommentSection(CommentSection {
                    id: section_id,
                    row_id: item.id,
                    can_comment: true,
                }));

                let committed = self
                    .order
                    .insert_held(item, req.order, extra, || {
                        self.load_item(ScopeKind::Columns, column_id)?;
                        self.check_label(project_id, label_id, LabelTarget::Row)
                    })
                    .await?;
                Ok((project_id, committed))
            })
            .await?;

        let change = row_change(&committed.outcome)?;
        self.announce(project_id, EventType::RowCreated, "row created", &change.rows)
            .await;
        drop(committed);
        Ok(change)
    }

    pub async fn update_row(
        &self,
        user: UserId,
        row_id: RowId,
        changes: RowChanges,
    ) -> BoardResult<RowChange> {
        if changes.is_empty() {
            return Err(BoardError::bad_request("nothing to update"));
        }
        let (project_id, committed) = self
            .bounded(async {
                let (row, project_id) = self.row_with_project(row_id)?;
                let auth = self.authorize(project_id, user, Role::Admin)?;
                if let Some(assignees) = &changes.assignee_ids {
                    check_assignees(&auth, assignees)?;
                }
                let name = changes
                    .name
                    .clone()
                    .map(|n| required_text("name", n))
                    .transpose()?;
                let order = changes.order;

                let committed = self
                    .order
                    .update_held(row.scope(), row_id, order, |body| {
                        self.check_label(project_id, changes.label_id, LabelTarget::Row)?;
                        if let ItemBody::Row(r) = body {
                            apply_row_changes(r, name, changes);
                        }
                        Ok(())
                    })
                    .await?;
                Ok((project_id, committed))
            })
            .await?;

        let change = row_change(&committed.outcome)?;
        self.announce(project_id, EventType::RowUpdated, "row updated", &change.rows)
            .await;
        drop(committed);
        Ok(change)
    }

    pub async fn move_row(&self, user: UserId, row_id: RowId, new_order: i64) -> BoardResult<RowChange> {
        let changes = RowChanges {
            order: Some(new_order),
            ..RowChanges::default()
        };
        self.update_row(user, row_id, changes).await
    }

    /// Delete a row with its comment section and checklist; later rows move
    /// up by one.
    pub async fn delete_row(&self, user: UserId, row_id: RowId) -> BoardResult<RowChange> {
        let (project_id, committed) = self
            .bounded(async {
                let (row, project_id) = self.row_with_project(row_id)?;
                self.authorize(project_id, user, Role::Admin)?;
                let committed = self
                    .order
                    .delete_held(row.scope(), row_id, WriteSet::new())
                    .await?;
                Ok((project_id, committed))
            })
            .await?;

        let change = row_change(&committed.outcome)?;
        self.announce(project_id, EventType::RowDeleted, "row deleted", &change.rows)
            .await;
        drop(committed);
        Ok(change)
    }

    pub async fn list_rows(&self, user: UserId, column_id: ColumnId) -> BoardResult<Vec<Row>> {
        self.bounded(async {
            let column = self.load_item(ScopeKind::Columns, column_id)?;
            self.authorize(column.scope_id, user, Role::Member)?;
            let items = self.order.list(ScopeRef::rows_of(column_id))?;
            Ok(items.iter().filter_map(Row::from_item).collect())
        })
        .await
    }

    // ─── Labels ───────────────────────────────────────────────────────

    pub async fn create_label(&self, user: UserId, req: NewLabel) -> BoardResult<Label> {
        let label = self
            .bounded(async {
                self.authorize(req.project_id, user, Role::Admin)?;
                let label = Label {
                    id: uuid::Uuid::new_v4(),
                    project_id: req.project_id,
                    target: req.target,
                    name: required_text("name", req.name)?,
                    color: required_text("color", req.color)?,
                };
                self.commit_one(WriteOp::PutLabel(label.clone()))?;
                Ok(label)
            })
            .await?;

        self.announce(label.project_id, EventType::LabelCreated, "label created", &label)
            .await;
        Ok(label)
    }

    pub async fn update_label(
        &self,
        user: UserId,
        label_id: LabelId,
        changes: LabelChanges,
    ) -> BoardResult<Label> {
        if changes.name.is_none() && changes.color.is_none() {
            return Err(BoardError::bad_request("nothing to update"));
        }
        let label = self
            .bounded(async {
                let mut label = self.load_label(label_id)?;
                self.authorize(label.project_id, user, Role::Admin)?;
                if let Some(name) = changes.name {
                    label.name = required_text("name", name)?;
                }
                if let Some(color) = changes.color {
                    label.color = required_text("color", color)?;
                }
                self.commit_one(WriteOp::PutLabel(label.clone()))?;
                Ok(label)
            })
            .await?;

        self.announce(label.project_id, EventType::LabelUpdated, "label updated", &label)
            .await;
        Ok(label)
    }

    /// Delete a label and detach it from every column or row using it.
    pub async fn delete_label(&self, user: UserId, label_id: LabelId) -> BoardResult<Label> {
        let (label, guards) = self
            .bounded(async {
                let label = self.load_label(label_id)?;
                self.authorize(label.project_id, user, Role::Admin)?;

                let (guards, items) = self.lock_project_scopes(label.project_id).await?;
                let mut writes = WriteSet::new();
                writes.push(WriteOp::DeleteLabel(label_id));
                for mut item in items {
                    if item.body.label_id() == Some(label_id) {
                        item.body.clear_label();
                        writes.push(WriteOp::PutItem(item));
                    }
                }
                self.store.commit(writes)?;
                Ok((label, guards))
            })
            .await?;

        self.announce(label.project_id, EventType::LabelDeleted, "label deleted", &label)
            .await;
        drop(guards);
        Ok(label)
    }

    pub async fn list_labels(&self, user: UserId, project_id: ProjectId) -> BoardResult<Vec<Label>> {
        self.bounded(async {
            self.authorize(project_id, user, Role::Member)?;
            Ok(self.store.list_labels(project_id)?)
        })
        .await
    }

    // ─── Comments ─────────────────────────────────────────────────────

    /// Open or close a comment section for new comments.
    pub async fn toggle_can_comment(
        &self,
        user: UserId,
        section_id: CommentSectionId,
    ) -> BoardResult<CommentSection> {
        let (project_id, section, guard) = self
            .bounded(async {
                let (guard, mut section, project_id) = self.lock_section(section_id).await?;
                self.authorize(project_id, user, Role::Admin)?;
                section.can_comment = !section.can_comment;
                self.commit_one(WriteOp::PutCommentSection(section.clone()))?;
                Ok((project_id, section, guard))
            })
            .await?;

        self.announce(
            project_id,
            EventType::CommentSectionUpdated,
            "comment section updated",
            &section,
        )
        .await;
        drop(guard);
        Ok(section)
    }

    pub async fn create_comment(
        &self,
        user: UserId,
        section_id: CommentSectionId,
        text: String,
    ) -> BoardResult<Comment> {
        let (project_id, comment, guard) = self
            .bounded(async {
                let (guard, section, project_id) = self.lock_section(section_id).await?;
                self.authorize(project_id, user, Role::Member)?;
                if !section.can_comment {
                    return Err(BoardError::bad_request(
                        "this comment section can't be commented",
                    ));
                }
                let comment = Comment {
                    id: uuid::Uuid::new_v4(),
                    section_id,
                    author_id: user,
                    text: required_text("text", text)?,
                    created_at: now_secs(),
                };
                self.commit_one(WriteOp::PutComment(comment.clone()))?;
                Ok((project_id, comment, guard))
            })
            .await?;

        self.announce(project_id, EventType::CommentCreated, "comment created", &comment)
            .await;
        drop(guard);
        Ok(comment)
    }

    /// Authors may delete their own comments; admins and the creator any.
    pub async fn delete_comment(&self, user: UserId, comment_id: CommentId) -> BoardResult<Comment> {
        let (project_id, comment) = self
            .bounded(async {
                let comment = self
                    .store
                    .load_comment(comment_id)?
                    .ok_or_else(|| BoardError::not_found(Entity::Comment, comment_id))?;
                let (_, project_id) = self.section_with_project(comment.section_id)?;
                let auth = self.directory.resolve_project_members(project_id)?;
                if comment.author_id != user {
                    auth.require(user, Role::Admin)?;
                }
                self.commit_one(WriteOp::DeleteComment(comment_id))?;
                Ok((project_id, comment))
            })
            .await?;

        self.announce(project_id, EventType::CommentDeleted, "comment deleted", &comment)
            .await;
        Ok(comment)
    }

    pub async fn list_comments(
        &self,
        user: UserId,
        section_id: CommentSectionId,
    ) -> BoardResult<Vec<Comment>> {
        self.bounded(async {
            let (_, project_id) = self.section_with_project(section_id)?;
            self.authorize(project_id, user, Role::Member)?;
            Ok(self.store.list_comments(section_id)?)
        })
        .await
    }

    // ─── Checklists ───────────────────────────────────────────────────

    /// Give a row its checklist. A row has at most one.
    pub async fn create_checklist(&self, user: UserId, row_id: RowId) -> BoardResult<Checklist> {
        let (project_id, checklist, guard) = self
            .bounded(async {
                let (guard, _, project_id) = self.lock_row(row_id).await?;
                self.authorize(project_id, user, Role::Admin)?;
                if self.store.checklist_of_row(row_id)?.is_some() {
                    return Err(BoardError::bad_request("checklist already exists"));
                }
                let checklist = Checklist {
                    id: uuid::Uuid::new_v4(),
                    row_id,
                };
                self.commit_one(WriteOp::PutChecklist(checklist.clone()))?;
                Ok((project_id, checklist, guard))
            })
            .await?;

        self.announce(project_id, EventType::ChecklistCreated, "checklist created", &checklist)
            .await;
        drop(guard);
        Ok(checklist)
    }

    /// Delete a checklist with all of its points.
    pub async fn delete_checklist(
        &self,
        user: UserId,
        checklist_id: ChecklistId,
    ) -> BoardResult<Checklist> {
        let (project_id, checklist, guard) = self
            .bounded(async {
                let (guard, checklist, project_id) = self.lock_checklist(checklist_id).await?;
                self.authorize(project_id, user, Role::Admin)?;
                self.commit_one(WriteOp::DeleteChecklist(checklist_id))?;
                Ok((project_id, checklist, guard))
            })
            .await?;

        self.announce(project_id, EventType::ChecklistDeleted, "checklist deleted", &checklist)
            .await;
        drop(guard);
        Ok(checklist)
    }

    pub async fn create_point(&self, user: UserId, req: NewPoint) -> BoardResult<Point> {
        let (project_id, point, guard) = self
            .bounded(async {
                let (guard, checklist, project_id) = self.lock_checklist(req.checklist_id).await?;
                self.authorize(project_id, user, Role::Admin)?;
                let point = Point {
                    id: uuid::Uuid::new_v4(),
                    checklist_id: checklist.id,
                    name: required_text("name", req.name)?,
                    description: req.description,
                    completed: false,
                    completed_at: None,
                    completed_by: None,
                    created_at: now_secs(),
                };
                self.commit_one(WriteOp::PutPoint(point.clone()))?;
                Ok((project_id, point, guard))
            })
            .await?;

        self.announce(project_id, EventType::PointCreated, "point created", &point)
            .await;
        drop(guard);
        Ok(point)
    }

    /// Rename or redescribe a point. Absent fields keep their value.
    pub async fn update_point(
        &self,
        user: UserId,
        point_id: PointId,
        changes: PointChanges,
    ) -> BoardResult<Point> {
        if changes.is_empty() {
            return Err(BoardError::bad_request("nothing to update"));
        }
        let (project_id, point, guard) = self
            .bounded(async {
                let (guard, mut point, project_id) = self.lock_point(point_id).await?;
                self.authorize(project_id, user, Role::Admin)?;
                if let Some(name) = changes.name {
                    point.name = required_text("name", name)?;
                }
                if let Some(description) = changes.description {
                    point.description = Some(description);
                }
                self.commit_one(WriteOp::PutPoint(point.clone()))?;
                Ok((project_id, point, guard))
            })
            .await?;

        self.announce(project_id, EventType::PointUpdated, "point updated", &point)
            .await;
        drop(guard);
        Ok(point)
    }

    /// Mark a point done, or open it again. Any participant may do this.
    pub async fn toggle_point(&self, user: UserId, point_id: PointId) -> BoardResult<Point> {
        let (project_id, point, guard) = self
            .bounded(async {
                let (guard, mut point, project_id) = self.lock_point(point_id).await?;
                self.authorize(project_id, user, Role::Member)?;
                point.toggle(user, now_secs());
                self.commit_one(WriteOp::PutPoint(point.clone()))?;
                Ok((project_id, point, guard))
            })
            .await?;

        self.announce(project_id, EventType::PointUpdated, "point status updated", &point)
            .await;
        drop(guard);
        Ok(point)
    }

    pub async fn delete_point(&self, user: UserId, point_id: PointId) -> BoardResult<Point> {
        let (project_id, point, guard) = self
            .bounded(async {
                let (guard, point, project_id) = self.lock_point(point_id).await?;
                self.authorize(project_id, user, Role::Admin)?;
                self.commit_one(WriteOp::DeletePoint(point_id))?;
                Ok((project_id, point, guard))
            })
            .await?;

        self.announce(project_id, EventType::PointDeleted, "point deleted", &point)
            .await;
        drop(guard);
        Ok(point)
    }

    /// Open points first, then completed ones.
    pub async fn list_points(
        &self,
        user: UserId,
        checklist_id: ChecklistId,
    ) -> BoardResult<Vec<Point>> {
        self.bounded(async {
            let checklist = self.load_checklist(checklist_id)?;
            let (_, project_id) = self.row_with_project(checklist.row_id)?;
            self.authorize(project_id, user, Role::Member)?;
            Ok(self.store.list_points(checklist_id)?)
        })
        .await
    }

    // ─── Helpers ──────────────────────────────────────────────────────

    async fn bounded<T, F>(&self, fut: F) -> BoardResult<T>
    where
        F: Future<Output = BoardResult<T>>,
    {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(result) => result,
            Err(_) => {
                log::warn!("Request exceeded {:?}", self.request_timeout);
                Err(BoardError::Timeout(self.request_timeout))
            }
        }
    }

    /// Publish after a commit. Failures are logged, never returned.
    ///
    /// Callers still hold the scope the commit touched, so events for one
    /// scope go out in commit order.
    async fn announce<P: Serialize>(
        &self,
        project_id: ProjectId,
        event_type: EventType,
        message: &str,
        payload: &P,
    ) {
        let payload = match serde_json::to_value(payload) {
            Ok(value) => value,
            Err(e) => {
                log::error!("Could not encode {event_type:?} payload: {e}");
                return;
            }
        };
        if let Err(e) = self.hub.publish(project_id, event_type, message, payload).await {
            log::warn!("Broadcast of {event_type:?} for project {project_id} failed: {e}");
        }
    }

    fn authorize(&self, project_id: ProjectId, user: UserId, min: Role) -> BoardResult<ProjectAuthSet> {
        let auth = self.directory.resolve_project_members(project_id)?;
        auth.require(user, min)?;
        Ok(auth)
    }

    fn commit_one(&self, op: WriteOp) -> BoardResult<()> {
        let mut writes = WriteSet::new();
        writes.push(op);
        Ok(self.store.commit(writes)?)
    }

    fn load_project(&self, id: ProjectId) -> BoardResult<Project> {
        self.store
            .load_project(id)?
            .ok_or_else(|| BoardError::not_found(Entity::Project, id))
    }

    fn load_item(&self, kind: ScopeKind, id: uuid::Uuid) -> BoardResult<OrderedItem> {
        let entity = match kind {
            ScopeKind::Columns => Entity::Column,
            ScopeKind::Rows => Entity::Row,
        };
        self.store
            .load_item(kind, id)?
            .ok_or_else(|| BoardError::not_found(entity, id))
    }

    fn load_label(&self, id: LabelId) -> BoardResult<Label> {
        self.store
            .load_label(id)?
            .ok_or_else(|| BoardError::not_found(Entity::Label, id))
    }

    fn load_section(&self, id: CommentSectionId) -> BoardResult<CommentSection> {
        self.store
            .load_comment_section(id)?
            .ok_or_else(|| BoardError::not_found(Entity::CommentSection, id))
    }

    fn load_checklist(&self, id: ChecklistId) -> BoardResult<Checklist> {
        self.store
            .load_checklist(id)?
            .ok_or_else(|| BoardError::not_found(Entity::Checklist, id))
    }

    fn load_point(&self, id: PointId) -> BoardResult<Point> {
        self.store
            .load_point(id)?
            .ok_or_else(|| BoardError::not_found(Entity::Point, id))
    }

    fn row_with_project(&self, row_id: RowId) -> BoardResult<(OrderedItem, ProjectId)> {
        let row = self.load_item(ScopeKind::Rows, row_id)?;
        let column = self.load_item(ScopeKind::Columns, row.scope_id)?;
        Ok((row, column.scope_id))
    }

    fn section_with_project(
        &self,
        section_id: CommentSectionId,
    ) -> BoardResult<(CommentSection, ProjectId)> {
        let section = self.load_section(section_id)?;
        let (_, project_id) = self.row_with_project(section.row_id)?;
        Ok((section, project_id))
    }

    /// Hold the row scope containing `row_id`, then look the row up again.
    ///
    /// Rows are only deleted under that scope (directly, or through their
    /// column or project), so anything attached to the row stays attached
    /// while the guard lives.
    async fn lock_row(&self, row_id: RowId) -> BoardResult<(ScopeGuard, OrderedItem, ProjectId)> {
        let (row, _) = self.row_with_project(row_id)?;
        let guard = self.order.locks().acquire(row.scope()).await;
        let (row, project_id) = self.row_with_project(row_id)?;
        Ok((guard, row, project_id))
    }

    async fn lock_section(
        &self,
        section_id: CommentSectionId,
    ) -> BoardResult<(ScopeGuard, CommentSection, ProjectId)> {
        let section = self.load_section(section_id)?;
        let (guard, _, project_id) = self.lock_row(section.row_id).await?;
        Ok((guard, self.load_section(section_id)?, project_id))
    }

    async fn lock_checklist(
        &self,
        checklist_id: ChecklistId,
    ) -> BoardResult<(ScopeGuard, Checklist, ProjectId)> {
        let checklist = self.load_checklist(checklist_id)?;
        let (guard, _, project_id) = self.lock_row(checklist.row_id).await?;
        Ok((guard, self.load_checklist(checklist_id)?, project_id))
    }

    async fn lock_point(&self, point_id: PointId) -> BoardResult<(ScopeGuard, Point, ProjectId)> {
        let point = self.load_point(point_id)?;
        let (guard, _, project_id) = self.lock_checklist(point.checklist_id).await?;
        Ok((guard, self.load_point(point_id)?, project_id))
    }

    fn check_label(
        &self,
        project_id: ProjectId,
        label_id: Option<LabelId>,
        target: LabelTarget,
    ) -> BoardResult<()> {
        let Some(label_id) = label_id else {
            return Ok(());
        };
        let label = self.load_label(label_id)?;
        if label.project_id != project_id {
            return Err(BoardError::bad_request("label does not belong to project"));
        }
        if label.target != target {
            return Err(BoardError::bad_request(match target {
                LabelTarget::Column => "label cannot be attached to a column",
                LabelTarget::Row => "label cannot be attached to a row",
            }));
        }
        Ok(())
    }

    /// Hold the project's column scope and every row scope under it.
    ///
    /// Locks are taken columns first, then rows in column order. Returns the
    /// guards and every column and row item of the project.
    async fn lock_project_scopes(
        &self,
        project_id: ProjectId,
    ) -> BoardResult<(Vec<ScopeGuard>, Vec<OrderedItem>)> {
        let columns_scope = ScopeRef::columns_of(project_id);
        let mut guards = vec![self.order.locks().acquire(columns_scope).await];
        let columns = self.store.load_scope(columns_scope)?;
        let mut items = Vec::new();
        for column in columns {
            let rows_scope = ScopeRef::rows_of(column.id);
            guards.push(self.order.locks().acquire(rows_scope).await);
            items.extend(self.store.load_scope(rows_scope)?);
            items.push(column);
        }
        Ok((guards, items))
    }
}

fn column_change(outcome: &OrderOutcome) -> BoardResult<ColumnChange> {
    let column = Column::from_item(&outcome.item)
        .ok_or_else(|| BoardError::bad_request("item is not a column"))?;
    let columns = outcome.scope_items.iter().filter_map(Column::from_item).collect();
    Ok(ColumnChange { column, columns })
}

fn row_change(outcome: &OrderOutcome) -> BoardResult<RowChange> {
    let row =
        Row::from_item(&outcome.item).ok_or_else(|| BoardError::bad_request("item is not a row"))?;
    let rows = outcome.scope_items.iter().filter_map(Row::from_item).collect();
    Ok(RowChange { row, rows })
}

fn apply_row_changes(row: &mut RowBody, name: Option<String>, changes: RowChanges) {
    if let Some(name) = name {
        row.name = name;
    }
    if let Some(description) = changes.description {
        row.description = Some(description);
    }
    if let Some(priority) = changes.priority {
        row.priority = Some(priority);
    }
    if let Some(label_id) = changes.label_id {
        row.label_id = Some(label_id);
    }
    if let Some(assignees) = changes.assignee_ids {
        row.assignee_ids = assignees;
    }
    if let Some(due) = changes.due_date {
        row.due_date = Some(due);
    }
}

fn required_text(field: &str, value: String) -> BoardResult<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(BoardError::bad_request(format!("{field} must not be empty")));
    }
    Ok(trimmed.to_string())
}

/// Creator, admins and members must be disjoint and free of duplicates.
fn check_roles(creator: UserId, admins: &[UserId], members: &[UserId]) -> BoardResult<()> {
    let mut seen = vec![creator];
    for id in admins.iter().chain(members) {
        if seen.contains(id) {
            return Err(BoardError::bad_request(
                "user should be unique for each category",
            ));
        }
        seen.push(*id);
    }
    Ok(())
}

fn check_assignees(auth: &ProjectAuthSet, assignees: &[UserId]) -> BoardResult<()> {
    for (idx, id) in assignees.iter().enumerate() {
        if assignees[..idx].contains(id) {
            return Err(BoardError::bad_request(format!("duplicate assignee: {id}")));
        }
        if !auth.contains(*id) {
            return Err(BoardError::bad_request(format!(
                "user {id} is not a project member"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{Connection, ConnectionId, TransportError};
    use crate::storage::MemoryStore;
    use std::sync::Mutex;
    use uuid::Uuid;

    fn service() -> BoardService {
        BoardService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ConnectionRegistry::new()),
            Duration::from_secs(5),
        )
    }

    /// Keeps every event it is sent.
    struct Recorder {
        id: ConnectionId,
        events: Mutex<Vec<Event>>,
    }

    impl Recorder {
        fn types(&self) -> Vec<EventType> {
            self.events.lock().unwrap().iter().map(|e| e.event_type).collect()
        }

        fn last(&self) -> Event {
            self.events.lock().unwrap().last().cloned().unwrap()
        }
    }

    #[async_trait::async_trait]
    impl Connection for Recorder {
        fn id(&self) -> ConnectionId {
            self.id
        }

        async fn send(&self, event: &Event) -> Result<(), TransportError> {
            self.events.lock().unwrap().push(event.clone());
            Ok(())
        }

        async fn close(&self) {}
    }

    async fn watch(svc: &BoardService, user: UserId) -> Arc<Recorder> {
        let rec = Arc::new(Recorder {
            id: Uuid::new_v4(),
            events: Mutex::new(Vec::new()),
        });
        svc.registry().register(user, rec.clone()).await;
        rec
    }

    fn new_column(project_id: ProjectId, name: &str, order: i64) -> NewColumn {
        NewColumn {
            project_id,
            name: name.into(),
            order,
            label_id: None,
        }
    }

    fn new_row(column_id: ColumnId, name: &str, order: i64) -> NewRow {
        NewRow {
            column_id,
            name: name.into(),
            description: None,
            order,
            priority: None,
            label_id: None,
            assignee_ids: vec![],
            due_date: None,
        }
    }

    fn new_label(project_id: ProjectId, target: LabelTarget) -> NewLabel {
        NewLabel {
            project_id,
            target,
            name: "urgent".into(),
            color: "#f00".into(),
        }
    }

    /// Release `guard` once the other branches of a `join!` are queued on it.
    async fn release_later(guard: ScopeGuard) {
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(guard);
    }

    async fn project_with(svc: &BoardService, creator: UserId, admins: Vec<UserId>, members: Vec<UserId>) -> Project {
        svc.create_project(
            creator,
            NewProject {
                name: "Board".into(),
                description: None,
                admin_ids: admins,
                member_ids: members,
            },
        )
        .await
        .unwrap()
    }

    #[test]
    fn test_check_roles() {
        let (c, a, m) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        assert!(check_roles(c, &[a], &[m]).is_ok());
        assert!(check_roles(c, &[c], &[]).is_err());
        assert!(check_roles(c, &[a], &[a]).is_err());
        assert!(check_roles(c, &[], &[m, m]).is_err());
    }

    #[tokio::test]
    async fn test_member_cannot_create_column() {
        let svc = service();
        let (c, m) = (Uuid::new_v4(), Uuid::new_v4());
        let project = project_with(&svc, c, vec![], vec![m]).await;

        let err = svc
            .create_column(
                m,
                NewColumn {
                    project_id: project.id,
                    name: "Todo".into(),
                    order: 1,
                    label_id: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));
        assert!(svc.list_columns(m, project.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_outsider_cannot_read() {
        let svc = service();
        let project = project_with(&svc, Uuid::new_v4(), vec![], vec![]).await;
        let err = svc.get_project(Uuid::new_v4(), project.id).await.unwrap_err();
        assert_eq!(err.status_code(), 401);
    }

    #[tokio::test]
    async fn test_empty_update_rejected() {
        let svc = service();
        let err = svc
            .update_row(Uuid::new_v4(), Uuid::new_v4(), RowChanges::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nothing to update");
    }

    #[tokio::test]
    async fn test_row_assignees_must_participate() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let column = svc
            .create_column(
                c,
                NewColumn {
                    project_id: project.id,
                    name: "Todo".into(),
                    order: 1,
                    label_id: None,
                },
            )
            .await
            .unwrap();

        let err = svc
            .create_row(
                c,
                NewRow {
                    column_id: column.column.id,
                    name: "task".into(),
                    description: None,
                    order: 1,
                    priority: None,
                    label_id: None,
                    assignee_ids: vec![Uuid::new_v4()],
                    due_date: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, BoardError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_zero_timeout_reports_timeout() {
        let svc = BoardService::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ConnectionRegistry::new()),
            Duration::ZERO,
        );
        let result = svc
            .bounded(async {
                tokio::task::yield_now().await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(BoardError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_row_insert_behind_column_delete_finds_column_gone() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;

        let held = svc.order.locks().acquire(ScopeRef::rows_of(column.id)).await;
        let (deleted, created, ()) = tokio::join!(
            svc.delete_column(c, column.id),
            svc.create_row(c, new_row(column.id, "task", 1)),
            release_later(held),
        );

        assert!(deleted.is_ok());
        assert!(matches!(
            created,
            Err(BoardError::NotFound { entity: Entity::Column, .. })
        ));
        assert!(svc
            .store()
            .load_scope(ScopeRef::rows_of(column.id))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_column_insert_behind_project_delete_finds_project_gone() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;

        let held = svc.order.locks().acquire(ScopeRef::columns_of(project.id)).await;
        let (deleted, created, ()) = tokio::join!(
            svc.delete_project(c, project.id),
            svc.create_column(c, new_column(project.id, "Todo", 1)),
            release_later(held),
        );

        assert!(deleted.is_ok());
        assert!(matches!(
            created,
            Err(BoardError::NotFound { entity: Entity::Project, .. })
        ));
        assert!(svc
            .store()
            .load_scope(ScopeRef::columns_of(project.id))
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_column_insert_behind_label_delete_is_rejected() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let label = svc
            .create_label(c, new_label(project.id, LabelTarget::Column))
            .await
            .unwrap();
        let req = NewColumn {
            label_id: Some(label.id),
            ..new_column(project.id, "Todo", 1)
        };

        let held = svc.order.locks().acquire(ScopeRef::columns_of(project.id)).await;
        let (deleted, created, ()) = tokio::join!(
            svc.delete_label(c, label.id),
            svc.create_column(c, req),
            release_later(held),
        );

        assert!(deleted.is_ok());
        assert!(matches!(
            created,
            Err(BoardError::NotFound { entity: Entity::Label, .. })
        ));
        assert!(svc.list_columns(c, project.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_column_relabel_behind_label_delete_is_rejected() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let label = svc
            .create_label(c, new_label(project.id, LabelTarget::Column))
            .await
            .unwrap();
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;
        let changes = ColumnChanges {
            label_id: Some(label.id),
            ..ColumnChanges::default()
        };

        let held = svc.order.locks().acquire(ScopeRef::columns_of(project.id)).await;
        let (deleted, updated, ()) = tokio::join!(
            svc.delete_label(c, label.id),
            svc.update_column(c, column.id, changes),
            release_later(held),
        );

        assert!(deleted.is_ok());
        assert!(updated.is_err());
        let columns = svc.list_columns(c, project.id).await.unwrap();
        assert_eq!(columns[0].label_id, None);
    }

    #[tokio::test]
    async fn test_row_relabel_behind_label_delete_is_rejected() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let label = svc
            .create_label(c, new_label(project.id, LabelTarget::Row))
            .await
            .unwrap();
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;
        let row = svc.create_row(c, new_row(column.id, "task", 1)).await.unwrap().row;
        let changes = RowChanges {
            label_id: Some(label.id),
            ..RowChanges::default()
        };

        let held = svc.order.locks().acquire(ScopeRef::rows_of(column.id)).await;
        let (deleted, updated, ()) = tokio::join!(
            svc.delete_label(c, label.id),
            svc.update_row(c, row.id, changes),
            release_later(held),
        );

        assert!(deleted.is_ok());
        assert!(matches!(
            updated,
            Err(BoardError::NotFound { entity: Entity::Label, .. })
        ));
        let rows = svc.list_rows(c, column.id).await.unwrap();
        assert_eq!(rows[0].label_id, None);
    }

    #[tokio::test]
    async fn test_delete_label_detaches_columns_and_rows() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let column_label = svc
            .create_label(c, new_label(project.id, LabelTarget::Column))
            .await
            .unwrap();
        let row_label = svc
            .create_label(c, new_label(project.id, LabelTarget::Row))
            .await
            .unwrap();
        let column = svc
            .create_column(
                c,
                NewColumn {
                    label_id: Some(column_label.id),
                    ..new_column(project.id, "Todo", 1)
                },
            )
            .await
            .unwrap()
            .column;
        svc.create_row(
            c,
            NewRow {
                label_id: Some(row_label.id),
                ..new_row(column.id, "task", 1)
            },
        )
        .await
        .unwrap();
        let rec = watch(&svc, c).await;

        svc.delete_label(c, column_label.id).await.unwrap();
        assert_eq!(svc.list_columns(c, project.id).await.unwrap()[0].label_id, None);
        assert_eq!(
            svc.list_rows(c, column.id).await.unwrap()[0].label_id,
            Some(row_label.id)
        );

        svc.delete_label(c, row_label.id).await.unwrap();
        assert_eq!(svc.list_rows(c, column.id).await.unwrap()[0].label_id, None);
        assert!(svc.list_labels(c, project.id).await.unwrap().is_empty());
        assert_eq!(rec.types(), vec![EventType::LabelDeleted, EventType::LabelDeleted]);
    }

    #[tokio::test]
    async fn test_closed_section_rejects_comments() {
        let svc = service();
        let (c, m) = (Uuid::new_v4(), Uuid::new_v4());
        let project = project_with(&svc, c, vec![], vec![m]).await;
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;
        let row = svc.create_row(c, new_row(column.id, "task", 1)).await.unwrap().row;
        let rec = watch(&svc, m).await;

        let err = svc.toggle_can_comment(m, row.comment_section_id).await.unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));

        let section = svc.toggle_can_comment(c, row.comment_section_id).await.unwrap();
        assert!(!section.can_comment);
        assert_eq!(rec.types(), vec![EventType::CommentSectionUpdated]);

        let err = svc
            .create_comment(m, row.comment_section_id, "hello".into())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "this comment section can't be commented");
        assert!(svc.list_comments(m, row.comment_section_id).await.unwrap().is_empty());
        assert_eq!(rec.types().len(), 1);

        svc.toggle_can_comment(c, row.comment_section_id).await.unwrap();
        svc.create_comment(m, row.comment_section_id, "hello".into())
            .await
            .unwrap();
        assert_eq!(rec.last().event_type, EventType::CommentCreated);
    }

    #[tokio::test]
    async fn test_comment_delete_permissions() {
        let svc = service();
        let (c, a, m1, m2) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let project = project_with(&svc, c, vec![a], vec![m1, m2]).await;
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;
        let section = svc
            .create_row(c, new_row(column.id, "task", 1))
            .await
            .unwrap()
            .row
            .comment_section_id;
        let first = svc.create_comment(m1, section, "one".into()).await.unwrap();
        let second = svc.create_comment(m1, section, "two".into()).await.unwrap();
        let rec = watch(&svc, c).await;

        let err = svc.delete_comment(m2, first.id).await.unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));
        assert!(rec.types().is_empty());

        svc.delete_comment(m1, first.id).await.unwrap();
        svc.delete_comment(a, second.id).await.unwrap();
        assert!(svc.list_comments(m2, section).await.unwrap().is_empty());
        assert_eq!(
            rec.types(),
            vec![EventType::CommentDeleted, EventType::CommentDeleted]
        );
    }

    #[tokio::test]
    async fn test_update_project_roles() {
        let svc = service();
        let (c, a, m) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let project = project_with(&svc, c, vec![a], vec![m]).await;
        let rec = watch(&svc, m).await;
        let rename = |name: &str| ProjectChanges {
            name: Some(name.into()),
            ..ProjectChanges::default()
        };

        let updated = svc.update_project(a, project.id, rename("Q3")).await.unwrap();
        assert_eq!(updated.name, "Q3");
        assert_eq!(rec.types(), vec![EventType::ProjectUpdated]);

        let err = svc.update_project(m, project.id, rename("Q4")).await.unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));

        let overlap = ProjectChanges {
            admin_ids: Some(vec![a, m]),
            ..ProjectChanges::default()
        };
        let err = svc.update_project(c, project.id, overlap).await.unwrap_err();
        assert!(matches!(err, BoardError::BadRequest(_)));

        assert_eq!(svc.get_project(m, project.id).await.unwrap().name, "Q3");
        assert_eq!(rec.types().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_row_cascades_comment_section() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;
        let row = svc.create_row(c, new_row(column.id, "task", 1)).await.unwrap().row;
        let comment = svc
            .create_comment(c, row.comment_section_id, "note".into())
            .await
            .unwrap();
        let rec = watch(&svc, c).await;

        let change = svc.delete_row(c, row.id).await.unwrap();
        assert!(change.rows.is_empty());
        assert!(svc
            .store()
            .load_comment_section(row.comment_section_id)
            .unwrap()
            .is_none());
        assert!(svc.store().load_comment(comment.id).unwrap().is_none());
        assert_eq!(rec.types(), vec![EventType::RowDeleted]);
    }

    #[tokio::test]
    async fn test_update_column_renames_and_moves() {
        let svc = service();
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        for (idx, name) in ["A", "B", "C"].iter().enumerate() {
            svc.create_column(c, new_column(project.id, name, idx as i64 + 1))
                .await
                .unwrap();
        }
        let last = svc.list_columns(c, project.id).await.unwrap()[2].id;
        let rec = watch(&svc, c).await;

        let change = svc
            .update_column(
                c,
                last,
                ColumnChanges {
                    name: Some("Done".into()),
                    order: Some(1),
                    ..ColumnChanges::default()
                },
            )
            .await
            .unwrap();

        let names: Vec<&str> = change.columns.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["Done", "A", "B"]);
        assert_eq!(change.column.order, 1);
        assert_eq!(rec.types(), vec![EventType::ColumnUpdated]);
    }

    #[tokio::test]
    async fn test_create_row_commits_section_in_same_batch() {
        let store = Arc::new(MemoryStore::new());
        let svc = BoardService::new(
            store.clone(),
            Arc::new(ConnectionRegistry::new()),
            Duration::from_secs(5),
        );
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;
        let rec = watch(&svc, c).await;

        let before = store.commit_count();
        let row = svc.create_row(c, new_row(column.id, "task", 1)).await.unwrap().row;
        assert_eq!(store.commit_count(), before + 1);

        let section = store.load_comment_section(row.comment_section_id).unwrap().unwrap();
        assert_eq!(section.row_id, row.id);
        assert!(section.can_comment);
        assert_eq!(rec.types(), vec![EventType::RowCreated]);
    }

    #[tokio::test]
    async fn test_failed_row_commit_leaves_column_empty() {
        let store = Arc::new(MemoryStore::new());
        let svc = BoardService::new(
            store.clone(),
            Arc::new(ConnectionRegistry::new()),
            Duration::from_secs(5),
        );
        let c = Uuid::new_v4();
        let project = project_with(&svc, c, vec![], vec![]).await;
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;

        store.fail_next_commit();
        let err = svc.create_row(c, new_row(column.id, "task", 1)).await.unwrap_err();
        assert_eq!(err.status_code(), 500);
        assert!(svc.list_rows(c, column.id).await.unwrap().is_empty());
    }

    async fn board_with_row(svc: &BoardService) -> (UserId, UserId, Row) {
        let (c, m) = (Uuid::new_v4(), Uuid::new_v4());
        let project = project_with(svc, c, vec![], vec![m]).await;
        let column = svc
            .create_column(c, new_column(project.id, "Todo", 1))
            .await
            .unwrap()
            .column;
        let row = svc.create_row(c, new_row(column.id, "task", 1)).await.unwrap().row;
        (c, m, row)
    }

    fn new_point(checklist_id: ChecklistId, name: &str) -> NewPoint {
        NewPoint {
            checklist_id,
            name: name.into(),
            description: Some("details".into()),
        }
    }

    #[tokio::test]
    async fn test_checklist_is_one_per_row_and_admin_only() {
        let svc = service();
        let (c, m, row) = board_with_row(&svc).await;
        let rec = watch(&svc, m).await;

        let err = svc.create_checklist(m, row.id).await.unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));

        let checklist = svc.create_checklist(c, row.id).await.unwrap();
        assert_eq!(checklist.row_id, row.id);

        let err = svc.create_checklist(c, row.id).await.unwrap_err();
        assert_eq!(err.to_string(), "checklist already exists");
        assert_eq!(rec.types(), vec![EventType::ChecklistCreated]);

        let err = svc.delete_checklist(m, checklist.id).await.unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));
        svc.delete_checklist(c, checklist.id).await.unwrap();
        assert_eq!(rec.last().event_type, EventType::ChecklistDeleted);
        svc.create_checklist(c, row.id).await.unwrap();
    }

    #[tokio::test]
    async fn test_point_lifecycle() {
        let svc = service();
        let (c, m, row) = board_with_row(&svc).await;
        let checklist = svc.create_checklist(c, row.id).await.unwrap();
        let rec = watch(&svc, m).await;

        let err = svc.create_point(m, new_point(checklist.id, "one")).await.unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));
        let first = svc.create_point(c, new_point(checklist.id, "one")).await.unwrap();
        let second = svc.create_point(c, new_point(checklist.id, "two")).await.unwrap();

        // Any participant may tick a point off.
        let done = svc.toggle_point(m, first.id).await.unwrap();
        assert!(done.completed);
        assert_eq!(done.completed_by, Some(m));
        assert!(done.completed_at.is_some());
        let ids: Vec<PointId> = svc
            .list_points(m, checklist.id)
            .await
            .unwrap()
            .iter()
            .map(|p| p.id)
            .collect();
        assert_eq!(ids, vec![second.id, first.id]);

        let reopened = svc.toggle_point(m, first.id).await.unwrap();
        assert!(!reopened.completed);
        assert_eq!(reopened.completed_by, None);
        assert_eq!(reopened.completed_at, None);

        let rename = PointChanges {
            name: Some("uno".into()),
            ..PointChanges::default()
        };
        let err = svc.update_point(m, first.id, rename.clone()).await.unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));
        let renamed = svc.update_point(c, first.id, rename).await.unwrap();
        assert_eq!(renamed.name, "uno");
        assert_eq!(renamed.description.as_deref(), Some("details"));
        let err = svc
            .update_point(c, first.id, PointChanges::default())
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "nothing to update");

        assert!(svc.delete_point(m, second.id).await.is_err());
        svc.delete_point(c, second.id).await.unwrap();
        assert_eq!(svc.list_points(c, checklist.id).await.unwrap().len(), 1);

        assert_eq!(
            rec.types(),
            vec![
                EventType::PointCreated,
                EventType::PointCreated,
                EventType::PointUpdated,
                EventType::PointUpdated,
                EventType::PointUpdated,
                EventType::PointDeleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_outsider_cannot_read_points() {
        let svc = service();
        let (c, _, row) = board_with_row(&svc).await;
        let checklist = svc.create_checklist(c, row.id).await.unwrap();
        let err = svc.list_points(Uuid::new_v4(), checklist.id).await.unwrap_err();
        assert!(matches!(err, BoardError::Unauthorized(_)));
    }

    #[tokio::test]
    async fn test_delete_row_takes_checklist_and_points() {
        let svc = service();
        let (c, _, row) = board_with_row(&svc).await;
        let checklist = svc.create_checklist(c, row.id).await.unwrap();
        let point = svc.create_point(c, new_point(checklist.id, "one")).await.unwrap();

        svc.delete_row(c, row.id).await.unwrap();
        assert!(svc.store().load_checklist(checklist.id).unwrap().is_none());
        assert!(svc.store().load_point(point.id).unwrap().is_none());
        let err = svc.list_points(c, checklist.id).await.unwrap_err();
        assert!(matches!(
            err,
            BoardError::NotFound { entity: Entity::Checklist, .. }
        ));
    }

    #[tokio::test]
    async fn test_checklist_behind_row_delete_finds_row_gone() {
        let svc = service();
        let (c, _, row) = board_with_row(&svc).await;

        let held = svc.order.locks().acquire(ScopeRef::rows_of(row.column_id)).await;
        let (deleted, created, ()) = tokio::join!(
            svc.delete_row(c, row.id),
            svc.create_checklist(c, row.id),
            release_later(held),
        );

        assert!(deleted.is_ok());
        assert!(matches!(
            created,
            Err(BoardError::NotFound { entity: Entity::Row, .. })
        ));
        assert!(svc.store().checklist_of_row(row.id).unwrap().is_none());
    }
}
