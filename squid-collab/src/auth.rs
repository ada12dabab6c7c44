//! Project authorization: who may see and mutate a project.

use std::sync::Arc;

use crate::error::{BoardError, BoardResult, Entity};
use crate::model::{Project, ProjectId, UserId};
use crate::storage::BoardStore;

/// A user's standing within a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Role {
    Member,
    Admin,
    Creator,
}

/// Everyone authorized to see a project. Resolved fresh for every check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectAuthSet {
    pub creator_id: UserId,
    pub admin_ids: Vec<UserId>,
    pub member_ids: Vec<UserId>,
}

impl ProjectAuthSet {
    pub fn from_project(project: &Project) -> Self {
        Self {
            creator_id: project.creator_id,
            admin_ids: project.admin_ids.clone(),
            member_ids: project.member_ids.clone(),
        }
    }

    /// Highest role held by `user`, if any.
    pub fn role_of(&self, user: UserId) -> Option<Role> {
        if self.creator_id == user {
            Some(Role::Creator)
        } else if self.admin_ids.contains(&user) {
            Some(Role::Admin)
        } else if self.member_ids.contains(&user) {
            Some(Role::Member)
        } else {
            None
        }
    }

    pub fn contains(&self, user: UserId) -> bool {
        self.role_of(user).is_some()
    }

    /// Creator, admins, members, in that order, without duplicates.
    pub fn user_ids(&self) -> Vec<UserId> {
        let mut ids = Vec::with_capacity(1 + self.admin_ids.len() + self.member_ids.len());
        for id in std::iter::once(&self.creator_id)
            .chain(&self.admin_ids)
            .chain(&self.member_ids)
        {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }

    /// Fails with `Unauthorized` unless `user` holds at least `min`.
    pub fn require(&self, user: UserId, min: Role) -> BoardResult<Role> {
        match self.role_of(user) {
            Some(role) if role >= min => Ok(role),
            Some(_) => Err(BoardError::Unauthorized(match min {
                Role::Creator => "only the project creator can do this",
                _ => "only the project creator or an admin can do this",
            })),
            None => Err(BoardError::Unauthorized("not a participant of this project")),
        }
    }
}

/// Resolves the authorized set of a project.
pub trait ProjectDirectory: Send + Sync {
    /// Fails with `NotFound` when the project does not exist.
    fn resolve_project_members(&self, project_id: ProjectId) -> BoardResult<ProjectAuthSet>;
}

/// [`ProjectDirectory`] reading project records from a [`BoardStore`].
pub struct StoreDirectory {
    store: Arc<dyn BoardStore>,
}

impl StoreDirectory {
    pub fn new(store: Arc<dyn BoardStore>) -> Self {
        Self { store }
    }
}

impl ProjectDirectory for StoreDirectory {
    fn resolve_project_members(&self, project_id: ProjectId) -> BoardResult<ProjectAuthSet> {
        self.store
            .load_project(project_id)?
            .map(|p| ProjectAuthSet::from_project(&p))
            .ok_or_else(|| BoardError::not_found(Entity::Project, project_id))
    }
}
