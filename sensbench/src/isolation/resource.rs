// Copyright (c) Facebook, Inc. and its affiliates.
use anyhow::Result;
use log::{debug, warn};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use super::cgroup::{Cgroup, CgroupState};
use crate::errors::{Error, ErrorCollection};
use crate::executor::kube::KubeApi;

pub type ResourceId = usize;

/// Everything a task may hold onto outside of its own process.
pub enum IsolationResource {
    Cgroup(Cgroup),
    Pod { api: KubeApi, name: String },
    RemoteSession { host: String, session: ssh2::Session },
}

impl IsolationResource {
    pub fn describe(&self) -> String {
        match self {
            Self::Cgroup(cg) => format!("cgroup {}", cg.spec()),
            Self::Pod { name, .. } => format!("pod {}", name),
            Self::RemoteSession { host, .. } => format!("ssh session to {}", host),
        }
    }

    fn prepare(&mut self) -> Result<()> {
        match self {
            Self::Cgroup(cg) => cg.create(),
            _ => Ok(()),
        }
    }

    fn check_usable(&self) -> Result<()> {
        match self {
            Self::Cgroup(cg) => match cg.state() {
                CgroupState::Created | CgroupState::Populated => Ok(()),
                state => Err(Error::cgroup(
                    cg.spec(),
                    format!("must be created before use, currently {:?}", state),
                )
                .into()),
            },
            _ => Ok(()),
        }
    }

    fn release(&mut self) -> Result<()> {
        match self {
            Self::Cgroup(cg) => cg.destroy(),
            Self::Pod { api, name } => api.delete_pod(name),
            Self::RemoteSession { host, session } => session
                .disconnect(None, "sensbench task done", None)
                .map_err(|e| Error::remote(host.as_str(), e).into()),
        }
    }
}

struct Entry {
    res: IsolationResource,
    users: usize,
}

/// Per-experiment owner of isolation resources. Handles refer to resources
/// by id and drop their reference on `clean`, the last user releases.
#[derive(Default)]
pub struct IsolationRegistry {
    entries: Mutex<BTreeMap<ResourceId, Entry>>,
    next_id: AtomicUsize,
}

impl IsolationRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Default::default())
    }

    pub fn register(&self, res: IsolationResource) -> ResourceId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        debug!("registry: [{}] {}", id, res.describe());
        self.entries
            .lock()
            .unwrap()
            .insert(id, Entry { res, users: 0 });
        id
    }

    /// Registers and prepares, e.g. creates the cgroup scope.
    pub fn register_prepared(&self, mut res: IsolationResource) -> Result<ResourceId> {
        res.prepare()?;
        Ok(self.register(res))
    }

    /// Resource IO such as cgcreate runs with the entry taken out of the
    /// map so that the registry lock is never held across it.
    pub fn prepare(&self, id: ResourceId) -> Result<()> {
        let mut ent = match self.entries.lock().unwrap().remove(&id) {
            Some(v) => v,
            None => {
                return Err(Error::launch(format!("resource {}", id), "not registered").into())
            }
        };
        let ret = ent.res.prepare();
        self.entries.lock().unwrap().insert(id, ent);
        ret
    }

    pub fn acquire(&self, id: ResourceId) -> Result<()> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get_mut(&id) {
            Some(ent) => {
                ent.res.check_usable()?;
                ent.users += 1;
                Ok(())
            }
            None => Err(Error::launch(format!("resource {}", id), "not registered").into()),
        }
    }

    /// Drops one reference. The resource is released with its last user and
    /// stays registered if the release fails.
    pub fn release(&self, id: ResourceId) -> Result<()> {
        let mut ent = {
            let mut entries = self.entries.lock().unwrap();
            match entries.get_mut(&id) {
                Some(ent) => {
                    ent.users = ent.users.saturating_sub(1);
                    if ent.users > 0 {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            }
            match entries.remove(&id) {
                Some(v) => v,
                None => return Ok(()),
            }
        };

        if let Err(e) = ent.res.release() {
            self.entries.lock().unwrap().insert(id, ent);
            return Err(e);
        }
        debug!("registry: [{}] released {}", id, ent.res.describe());
        Ok(())
    }

    /// Releases everything still registered regardless of users.
    pub fn release_all(&self) -> Result<()> {
        let taken = std::mem::take(&mut *self.entries.lock().unwrap());
        let mut errs = ErrorCollection::new();
        let mut failed = vec![];
        for (id, mut ent) in taken.into_iter().rev() {
            if ent.users > 0 {
                warn!(
                    "registry: Force releasing {} with {} users",
                    ent.res.describe(),
                    ent.users
                );
            }
            match ent.res.release() {
                Ok(()) => debug!("registry: [{}] released {}", id, ent.res.describe()),
                Err(e) => {
                    errs.add::<(), _>(Err(e));
                    failed.push((id, ent));
                }
            }
        }
        self.entries.lock().unwrap().extend(failed);
        errs.into_result()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn users(&self, id: ResourceId) -> Option<usize> {
        self.entries.lock().unwrap().get(&id).map(|ent| ent.users)
    }
}

/// The resources one task holds. Released at most once.
pub struct Attachment {
    registry: Arc<IsolationRegistry>,
    ids: Vec<ResourceId>,
    released: AtomicBool,
}

impl Attachment {
    /// Takes a reference on each of `ids`, rolling back on failure.
    pub fn acquire(registry: &Arc<IsolationRegistry>, ids: &[ResourceId]) -> Result<Self> {
        for (idx, id) in ids.iter().enumerate() {
            if let Err(e) = registry.acquire(*id) {
                for prev in ids[..idx].iter() {
                    let _ = registry.release(*prev);
                }
                return Err(e);
            }
        }
        Ok(Self {
            registry: registry.clone(),
            ids: ids.to_vec(),
            released: AtomicBool::new(false),
        })
    }

    /// Adds an already acquired resource, e.g. the pod or ssh session the
    /// task itself runs in.
    pub fn push_owned(&mut self, id: ResourceId) -> Result<()> {
        self.registry.acquire(id)?;
        self.ids.push(id);
        Ok(())
    }

    pub fn ids(&self) -> &[ResourceId] {
        &self.ids
    }

    pub fn release(&self) -> Result<()> {
        if self.released.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let mut errs = ErrorCollection::new();
        for id in self.ids.iter().rev() {
            errs.add(self.registry.release(*id));
        }
        errs.into_result()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isolation::cgroup::CgroupKind;
    use std::net::TcpListener;
    use std::thread;

    fn absent_cgroup() -> IsolationResource {
        IsolationResource::Cgroup(Cgroup::with_root(
            "sb-test",
            CgroupKind::CpuShares(2),
            "/nonexistent",
        ))
    }

    #[test]
    fn test_acquire_requires_created() {
        let reg = IsolationRegistry::new();
        let id = reg.register(absent_cgroup());
        assert!(reg.acquire(id).is_err());
        assert!(Attachment::acquire(&reg, &[id]).is_err());
        assert_eq!(reg.users(id), Some(0));
        assert!(reg.acquire(id + 1).is_err());

        // An absent scope releases trivially.
        reg.release_all().unwrap();
        assert!(reg.is_empty());
    }

    #[test]
    fn test_release_is_idempotent() {
        let reg = IsolationRegistry::new();
        let id = reg.register(absent_cgroup());
        let att = Attachment {
            registry: reg.clone(),
            ids: vec![id],
            released: AtomicBool::new(false),
        };
        reg.entries.lock().unwrap().get_mut(&id).unwrap().users = 2;

        att.release().unwrap();
        att.release().unwrap();
        assert_eq!(reg.users(id), Some(1));
        reg.release(id).unwrap();
        assert_eq!(reg.users(id), None);
        reg.release(id).unwrap();
    }

    #[test]
    fn test_release_runs_unlocked() {
        let _ = ::env_logger::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let reg = IsolationRegistry::new();
        let pod = reg.register(IsolationResource::Pod {
            api: KubeApi::new(&addr, "default", None, None),
            name: "sb-test-pod".into(),
        });
        let cg = reg.register(absent_cgroup());

        let releaser = {
            let reg = reg.clone();
            thread::spawn(move || reg.release_all())
        };

        // The delete request is in flight and the registry stays usable.
        let (conn, _) = listener.accept().unwrap();
        assert_eq!(reg.users(cg), None);
        assert_eq!(reg.users(pod), None);
        assert!(reg.is_empty());

        // Hanging up fails the release and the pod is kept for a retry.
        drop(conn);
        assert!(releaser.join().unwrap().is_err());
        assert_eq!(reg.users(pod), Some(0));
        assert_eq!(reg.len(), 1);
    }
}
