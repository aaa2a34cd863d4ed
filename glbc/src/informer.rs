use std::{collections::HashSet, fmt::Debug, hash::Hash, sync::Arc};

use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::{
    WatchStreamExt,
    reflector::{ObjectRef, Store, store::Writer},
    watcher::{self, watcher},
};
use serde::de::DeserializeOwned;

/// A change of a watched object, as seen by the local cache.
#[derive(Debug)]
pub(crate) enum WatchEvent<K> {
    Added(Arc<K>),
    Updated { old: Arc<K>, new: Arc<K> },
    Deleted(Arc<K>),
}

/// Keeps a reflector store of `K` up to date and turns the raw watch stream
/// into add/update/delete notifications.
pub(crate) struct Informer<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Default + Eq + Hash + Clone,
{
    writer: Writer<K>,
    store: Store<K>,
    /// Objects received since the start of a relist.
    relisted: Option<Vec<K>>,
}

impl<K> Informer<K>
where
    K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    K::DynamicType: Default + Eq + Hash + Clone + Send + Sync,
{
    pub(crate) fn new(writer: Writer<K>) -> Self {
        let store = writer.as_reader();
        Self {
            writer,
            store,
            relisted: None,
        }
    }

    fn notification(&self, obj: &K) -> WatchEvent<K> {
        let new = Arc::new(obj.clone());
        match self.store.get(&ObjectRef::from_obj(obj)) {
            Some(old) => WatchEvent::Updated { old, new },
            None => WatchEvent::Added(new),
        }
    }

    /// Applies the event to the store and returns the resulting notifications.
    /// Objects of a relist are only reported once the whole relist is in the
    /// store, objects missing from it are reported as deleted.
    fn apply(&mut self, event: watcher::Event<K>) -> Vec<WatchEvent<K>> {
        let mut events = Vec::new();
        match &event {
            watcher::Event::InitApply(obj) if self.relisted.is_some() => {
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.push(obj.clone());
                }
            }
            watcher::Event::Apply(obj) | watcher::Event::InitApply(obj) => {
                events.push(self.notification(obj));
            }
            watcher::Event::Delete(obj) => {
                events.push(WatchEvent::Deleted(Arc::new(obj.clone())));
            }
            watcher::Event::Init => {
                self.relisted = Some(Vec::new());
            }
            watcher::Event::InitDone => {
                if let Some(relisted) = self.relisted.take() {
                    let seen: HashSet<ObjectRef<K>> =
                        relisted.iter().map(ObjectRef::from_obj).collect();
                    events.extend(
                        self.store
                            .state()
                            .into_iter()
                            .filter(|old| !seen.contains(&ObjectRef::from_obj(old.as_ref())))
                            .map(WatchEvent::Deleted),
                    );
                    events.extend(relisted.iter().map(|obj| self.notification(obj)));
                }
            }
        }
        self.writer.apply_watcher_event(&event);
        events
    }

    /// Watches `api` until the stream ends, calling `handler` for every change.
    pub(crate) async fn run<H>(mut self, api: Api<K>, mut handler: H)
    where
        H: FnMut(WatchEvent<K>) + Send,
    {
        let mut stream = watcher(api, watcher::Config::default())
            .default_backoff()
            .boxed();
        while let Some(event) = stream.next().await {
            match event {
                Ok(event) => {
                    for e in self.apply(event) {
                        handler(e);
                    }
                }
                Err(e) => {
                    warn!(
                        "watch of {} failed: {}",
                        K::kind(&Default::default()),
                        e
                    );
                }
            }
        }
        warn!("watch of {} ended", K::kind(&Default::default()));
    }
}
