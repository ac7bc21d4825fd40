//! Allocation persistence.
//!
//! The engine only talks to the [`AllocationStore`] and [`Directory`] traits.
//! [`EventStore`] implements both: every mutation becomes an [`Event`] that is
//! handed to a [`Journal`] first and applied in memory only once the journal
//! accepted it. [`InMemoryStore`] journals nowhere; [`WalStore`] journals to a
//! group-commit WAL.

mod durable;

pub use durable::{WalJournal, WalStore};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use ulid::Ulid;

use crate::model::*;
use crate::notify::NotifyHub;

pub type SharedEmployeeState = Arc<RwLock<EmployeeState>>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    #[error("WAL error: {0}")]
    Wal(String),
    #[error("not found: {0}")]
    NotFound(Ulid),
    #[error("already exists: {0}")]
    AlreadyExists(Ulid),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Durable collection of allocation records. Sole writer of allocations.
#[async_trait]
pub trait AllocationStore: Send + Sync {
    /// Persist a new allocation under a freshly assigned id.
    async fn create_allocation(&self, new: NewAllocation) -> Result<Allocation, StoreError>;

    /// Re-insert a previously deleted allocation under its original id.
    async fn restore_allocation(&self, allocation: Allocation) -> Result<(), StoreError>;

    async fn get_allocation_by_id(&self, id: Ulid) -> Result<Option<Allocation>, StoreError>;

    /// Replace span and phase in place. Identity, employee and project never change.
    async fn update_allocation(
        &self,
        id: Ulid,
        span: Span,
        phase_id: Option<Ulid>,
    ) -> Result<Allocation, StoreError>;

    async fn delete_allocation(&self, id: Ulid) -> Result<Allocation, StoreError>;

    /// Sorted by `(span.start, id)`.
    async fn get_employee_allocations(&self, employee_id: Ulid)
        -> Result<Vec<Allocation>, StoreError>;

    async fn get_project_allocations(&self, project_id: Ulid)
        -> Result<Vec<Allocation>, StoreError>;

    async fn get_phase_allocations(&self, phase_id: Ulid) -> Result<Vec<Allocation>, StoreError>;

    /// Allocations of `employee_id` on `project_id`; narrowed to one phase when given.
    async fn find_existing_allocations(
        &self,
        employee_id: Ulid,
        project_id: Ulid,
        phase_id: Option<Ulid>,
    ) -> Result<Vec<Allocation>, StoreError>;

    async fn delete_allocations_by_employee_and_project(
        &self,
        employee_id: Ulid,
        project_id: Ulid,
    ) -> Result<Vec<Allocation>, StoreError>;

    async fn delete_allocations_by_employee_and_phase(
        &self,
        employee_id: Ulid,
        phase_id: Ulid,
    ) -> Result<Vec<Allocation>, StoreError>;
}

/// Existence checks for the records allocations point at.
#[async_trait]
pub trait Directory: Send + Sync {
    async fn employee_exists(&self, id: Ulid) -> Result<bool, StoreError>;
    async fn project_exists(&self, id: Ulid) -> Result<bool, StoreError>;
    /// Project owning `phase_id`, or `None` for an unknown phase.
    async fn phase_project(&self, phase_id: Ulid) -> Result<Option<Ulid>, StoreError>;

    async fn register_employee(&self, employee: Employee) -> Result<(), StoreError>;
    async fn register_project(&self, project: Project) -> Result<(), StoreError>;
    async fn register_phase(&self, phase: Phase) -> Result<(), StoreError>;
}

/// Where an event goes before it is applied in memory.
#[async_trait]
pub trait Journal: Send + Sync + 'static {
    /// Either every event in `events` is journaled or none is.
    async fn append_all(&self, events: &[Event]) -> Result<(), StoreError>;

    async fn append(&self, event: &Event) -> Result<(), StoreError> {
        self.append_all(std::slice::from_ref(event)).await
    }
}

/// No durability: events live only in memory.
pub struct Volatile;

#[async_trait]
impl Journal for Volatile {
    async fn append_all(&self, _events: &[Event]) -> Result<(), StoreError> {
        Ok(())
    }
}

pub type InMemoryStore = EventStore<Volatile>;

pub struct EventStore<J: Journal> {
    journal: J,
    /// Allocations grouped by employee.
    by_employee: DashMap<Ulid, SharedEmployeeState>,
    /// Reverse lookup: allocation id → employee id.
    owner: DashMap<Ulid, Ulid>,
    employees: DashMap<Ulid, Employee>,
    projects: DashMap<Ulid, Project>,
    phases: DashMap<Ulid, Phase>,
    /// Held shared by every write, exclusively by compaction. Always taken
    /// before any employee lock.
    commit_gate: RwLock<()>,
    /// Serializes the exists check and commit of registrations.
    registering: Mutex<()>,
    notify: Arc<NotifyHub>,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        EventStore::from_events(Volatile, &[])
    }
}

impl<J: Journal> EventStore<J> {
    /// Build a store whose state is the result of applying `events` in order.
    pub(crate) fn from_events(journal: J, events: &[Event]) -> Self {
        let store = Self {
            journal,
            by_employee: DashMap::new(),
            owner: DashMap::new(),
            employees: DashMap::new(),
            projects: DashMap::new(),
            phases: DashMap::new(),
            commit_gate: RwLock::new(()),
            registering: Mutex::new(()),
            notify: Arc::new(NotifyHub::new()),
        };

        // Nothing else can see the store yet: build plain states, wrap at the end.
        let mut states: HashMap<Ulid, EmployeeState> = HashMap::new();
        for event in events {
            match event.employee_id() {
                Some(employee_id) if is_allocation_event(event) => {
                    let es = states
                        .entry(employee_id)
                        .or_insert_with(|| EmployeeState::new(employee_id));
                    store.apply_allocation(es, event);
                }
                _ => store.apply_registration(event),
            }
        }
        for (id, es) in states {
            store.by_employee.insert(id, Arc::new(RwLock::new(es)));
        }
        store
    }

    pub fn notify(&self) -> &Arc<NotifyHub> {
        &self.notify
    }

    /// Stream of committed events touching one employee.
    pub fn subscribe(&self, employee_id: Ulid) -> broadcast::Receiver<Event> {
        self.notify.subscribe(employee_id)
    }

    pub fn allocation_count(&self) -> usize {
        self.owner.len()
    }

    fn employee_state(&self, employee_id: Ulid) -> SharedEmployeeState {
        self.by_employee
            .entry(employee_id)
            .or_insert_with(|| Arc::new(RwLock::new(EmployeeState::new(employee_id))))
            .clone()
    }

    fn existing_state(&self, employee_id: &Ulid) -> Option<SharedEmployeeState> {
        self.by_employee.get(employee_id).map(|e| e.value().clone())
    }

    fn state_for_allocation(&self, id: Ulid) -> Result<SharedEmployeeState, StoreError> {
        let employee_id = self
            .owner
            .get(&id)
            .map(|e| *e.value())
            .ok_or(StoreError::NotFound(id))?;
        self.existing_state(&employee_id)
            .ok_or(StoreError::NotFound(id))
    }

    /// Apply an allocation event (no locking; the caller holds the employee state lock).
    fn apply_allocation(&self, es: &mut EmployeeState, event: &Event) {
        match event {
            Event::AllocationCreated {
                id,
                employee_id,
                project_id,
                phase_id,
                span,
            } => {
                es.insert(Allocation {
                    id: *id,
                    employee_id: *employee_id,
                    project_id: *project_id,
                    phase_id: *phase_id,
                    span: *span,
                });
                self.owner.insert(*id, *employee_id);
            }
            Event::AllocationUpdated {
                id, span, phase_id, ..
            } => {
                // remove + insert keeps the start ordering intact
                if let Some(mut allocation) = es.remove(*id) {
                    allocation.span = *span;
                    allocation.phase_id = *phase_id;
                    es.insert(allocation);
                }
            }
            Event::AllocationDeleted { id, .. } => {
                es.remove(*id);
                self.owner.remove(id);
            }
            Event::EmployeeRegistered { .. }
            | Event::ProjectRegistered { .. }
            | Event::PhaseRegistered { .. } => {}
        }
    }

    fn apply_registration(&self, event: &Event) {
        match event {
            Event::EmployeeRegistered { id, name } => {
                self.employees.insert(
                    *id,
                    Employee {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::ProjectRegistered { id, name } => {
                self.projects.insert(
                    *id,
                    Project {
                        id: *id,
                        name: name.clone(),
                    },
                );
            }
            Event::PhaseRegistered {
                id,
                project_id,
                name,
            } => {
                self.phases.insert(
                    *id,
                    Phase {
                        id: *id,
                        project_id: *project_id,
                        name: name.clone(),
                    },
                );
            }
            _ => {}
        }
    }

    /// Journal + apply + notify for one allocation event. Caller holds the
    /// commit gate and the employee's write lock.
    async fn commit(&self, es: &mut EmployeeState, event: Event) -> Result<(), StoreError> {
        self.journal.append(&event).await?;
        self.apply_allocation(es, &event);
        self.notify.send(&event);
        Ok(())
    }

    fn already_registered(&self, event: &Event) -> Option<Ulid> {
        match event {
            Event::EmployeeRegistered { id, .. } if self.employees.contains_key(id) => Some(*id),
            Event::ProjectRegistered { id, .. } if self.projects.contains_key(id) => Some(*id),
            Event::PhaseRegistered { id, .. } if self.phases.contains_key(id) => Some(*id),
            _ => None,
        }
    }

    async fn commit_registration(&self, event: Event) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        let _registering = self.registering.lock().await;
        if let Some(id) = self.already_registered(&event) {
            return Err(StoreError::AlreadyExists(id));
        }
        self.journal.append(&event).await?;
        self.apply_registration(&event);
        self.notify.send(&event);
        Ok(())
    }

    async fn delete_where(
        &self,
        employee_id: Ulid,
        matches: impl Fn(&Allocation) -> bool + Send,
    ) -> Result<Vec<Allocation>, StoreError> {
        let _gate = self.commit_gate.read().await;
        let Some(state) = self.existing_state(&employee_id) else {
            return Ok(Vec::new());
        };
        let mut es = state.write().await;
        let victims: Vec<Allocation> = es.allocations.iter().filter(|&a| matches(a)).cloned().collect();
        if victims.is_empty() {
            return Ok(victims);
        }
        let events: Vec<Event> = victims
            .iter()
            .map(|victim| Event::AllocationDeleted {
                id: victim.id,
                employee_id,
            })
            .collect();
        // one journal write for the whole batch: a failure deletes nothing
        self.journal.append_all(&events).await?;
        for event in &events {
            self.apply_allocation(&mut es, event);
            self.notify.send(event);
        }
        Ok(victims)
    }

    async fn scan(&self, matches: impl Fn(&Allocation) -> bool + Send) -> Vec<Allocation> {
        // Clone the Arcs out first; never hold a DashMap shard across an await.
        let states: Vec<SharedEmployeeState> =
            self.by_employee.iter().map(|e| e.value().clone()).collect();
        let mut found = Vec::new();
        for state in states {
            let es = state.read().await;
            found.extend(es.allocations.iter().filter(|&a| matches(a)).cloned());
        }
        found.sort_by_key(|a| (a.span.start, a.id));
        found
    }

    /// Minimal event list recreating the current state. Caller holds the
    /// commit gate exclusively.
    async fn snapshot_events(&self) -> Vec<Event> {
        let mut events = Vec::new();
        for e in self.employees.iter() {
            events.push(Event::EmployeeRegistered {
                id: e.id,
                name: e.name.clone(),
            });
        }
        for p in self.projects.iter() {
            events.push(Event::ProjectRegistered {
                id: p.id,
                name: p.name.clone(),
            });
        }
        for ph in self.phases.iter() {
            events.push(Event::PhaseRegistered {
                id: ph.id,
                project_id: ph.project_id,
                name: ph.name.clone(),
            });
        }
        let states: Vec<SharedEmployeeState> =
            self.by_employee.iter().map(|e| e.value().clone()).collect();
        for state in states {
            let es = state.read().await;
            events.extend(es.allocations.iter().map(Event::created));
        }
        events
    }
}

fn is_allocation_event(event: &Event) -> bool {
    matches!(
        event,
        Event::AllocationCreated { .. }
            | Event::AllocationUpdated { .. }
            | Event::AllocationDeleted { .. }
    )
}

#[async_trait]
impl<J: Journal> AllocationStore for EventStore<J> {
    async fn create_allocation(&self, new: NewAllocation) -> Result<Allocation, StoreError> {
        let _gate = self.commit_gate.read().await;
        let allocation = new.into_allocation(Ulid::new());
        let state = self.employee_state(allocation.employee_id);
        let mut es = state.write().await;
        self.commit(&mut es, Event::created(&allocation)).await?;
        Ok(allocation)
    }

    async fn restore_allocation(&self, allocation: Allocation) -> Result<(), StoreError> {
        let _gate = self.commit_gate.read().await;
        let state = self.employee_state(allocation.employee_id);
        let mut es = state.write().await;
        if self.owner.contains_key(&allocation.id) {
            return Err(StoreError::AlreadyExists(allocation.id));
        }
        self.commit(&mut es, Event::created(&allocation)).await
    }

    async fn get_allocation_by_id(&self, id: Ulid) -> Result<Option<Allocation>, StoreError> {
        let state = match self.state_for_allocation(id) {
            Ok(state) => state,
            Err(_) => return Ok(None),
        };
        let es = state.read().await;
        Ok(es.get(id).cloned())
    }

    async fn update_allocation(
        &self,
        id: Ulid,
        span: Span,
        phase_id: Option<Ulid>,
    ) -> Result<Allocation, StoreError> {
        let _gate = self.commit_gate.read().await;
        let state = self.state_for_allocation(id)?;
        let mut es = state.write().await;
        // may have been deleted between the lookup and the lock
        let current = es.get(id).cloned().ok_or(StoreError::NotFound(id))?;
        let event = Event::AllocationUpdated {
            id,
            employee_id: current.employee_id,
            span,
            phase_id,
        };
        self.commit(&mut es, event).await?;
        Ok(Allocation {
            span,
            phase_id,
            ..current
        })
    }

    async fn delete_allocation(&self, id: Ulid) -> Result<Allocation, StoreError> {
        let _gate = self.commit_gate.read().await;
        let state = self.state_for_allocation(id)?;
        let mut es = state.write().await;
        let current = es.get(id).cloned().ok_or(StoreError::NotFound(id))?;
        let event = Event::AllocationDeleted {
            id,
            employee_id: current.employee_id,
        };
        self.commit(&mut es, event).await?;
        Ok(current)
    }

    async fn get_employee_allocations(
        &self,
        employee_id: Ulid,
    ) -> Result<Vec<Allocation>, StoreError> {
        match self.existing_state(&employee_id) {
            Some(state) => Ok(state.read().await.allocations.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn get_project_allocations(
        &self,
        project_id: Ulid,
    ) -> Result<Vec<Allocation>, StoreError> {
        Ok(self.scan(|a| a.project_id == project_id).await)
    }

    async fn get_phase_allocations(&self, phase_id: Ulid) -> Result<Vec<Allocation>, StoreError> {
        Ok(self.scan(|a| a.phase_id == Some(phase_id)).await)
    }

    async fn find_existing_allocations(
        &self,
        employee_id: Ulid,
        project_id: Ulid,
        phase_id: Option<Ulid>,
    ) -> Result<Vec<Allocation>, StoreError> {
        let mut found = self.get_employee_allocations(employee_id).await?;
        found.retain(|a| {
            a.project_id == project_id && phase_id.is_none_or(|p| a.phase_id == Some(p))
        });
        Ok(found)
    }

    async fn delete_allocations_by_employee_and_project(
        &self,
        employee_id: Ulid,
        project_id: Ulid,
    ) -> Result<Vec<Allocation>, StoreError> {
        self.delete_where(employee_id, |a| a.project_id == project_id)
            .await
    }

    async fn delete_allocations_by_employee_and_phase(
        &self,
        employee_id: Ulid,
        phase_id: Ulid,
    ) -> Result<Vec<Allocation>, StoreError> {
        self.delete_where(employee_id, |a| a.phase_id == Some(phase_id))
            .await
    }
}

#[async_trait]
impl<J: Journal> Directory for EventStore<J> {
    async fn employee_exists(&self, id: Ulid) -> Result<bool, StoreError> {
        Ok(self.employees.contains_key(&id))
    }

    async fn project_exists(&self, id: Ulid) -> Result<bool, StoreError> {
        Ok(self.projects.contains_key(&id))
    }

    async fn phase_project(&self, phase_id: Ulid) -> Result<Option<Ulid>, StoreError> {
        Ok(self.phases.get(&phase_id).map(|p| p.project_id))
    }

    async fn register_employee(&self, employee: Employee) -> Result<(), StoreError> {
        self.commit_registration(Event::EmployeeRegistered {
            id: employee.id,
            name: employee.name,
        })
        .await
    }

    async fn register_project(&self, project: Project) -> Result<(), StoreError> {
        self.commit_registration(Event::ProjectRegistered {
            id: project.id,
            name: project.name,
        })
        .await
    }

    async fn register_phase(&self, phase: Phase) -> Result<(), StoreError> {
        self.commit_registration(Event::PhaseRegistered {
            id: phase.id,
            project_id: phase.project_id,
            name: phase.name,
        })
        .await
    }
}
