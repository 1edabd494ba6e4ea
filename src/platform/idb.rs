//! IndexedDB snapshot store
//!
//! One object store keyed by record name. The connection opens lazily on
//! first use and is cached; a failed transaction drops the cache so the next
//! call reopens.

use std::cell::RefCell;
use std::rc::Rc;

use wasm_bindgen::closure::Closure;
use wasm_bindgen::{JsCast, JsValue};
use web_sys::{IdbDatabase, IdbTransactionMode};

use super::snapshot_store::{LoadCallback, SaveCallback, SnapshotStore};
use super::storage::StorageError;

const DB_VERSION: u32 = 1;

type Pending<T> = Rc<RefCell<Option<Box<dyn FnOnce(Result<T, StorageError>)>>>>;

fn pending<T>(callback: Box<dyn FnOnce(Result<T, StorageError>)>) -> Pending<T> {
    Rc::new(RefCell::new(Some(callback)))
}

/// Complete a callback shared between success and error handlers
fn settle<T>(pending: &Pending<T>, result: Result<T, StorageError>) {
    let callback = pending.borrow_mut().take();
    if let Some(callback) = callback {
        callback(result);
    }
}

fn js_error(context: &str, err: JsValue) -> StorageError {
    let detail = err.as_string().unwrap_or_else(|| format!("{err:?}"));
    StorageError::Unavailable(format!("{context}: {detail}"))
}

#[derive(Clone)]
pub struct IdbSnapshotStore {
    db_name: String,
    store_name: String,
    db: Rc<RefCell<Option<IdbDatabase>>>,
}

impl IdbSnapshotStore {
    pub fn new(db_name: impl Into<String>, store_name: impl Into<String>) -> Self {
        Self {
            db_name: db_name.into(),
            store_name: store_name.into(),
            db: Rc::new(RefCell::new(None)),
        }
    }

    fn with_db(&self, done: Box<dyn FnOnce(Result<IdbDatabase, StorageError>)>) {
        let cached = self.db.borrow().clone();
        if let Some(db) = cached {
            return done(Ok(db));
        }

        let factory = match web_sys::window().map(|w| w.indexed_db()) {
            Some(Ok(Some(factory))) => factory,
            Some(Err(e)) => return done(Err(js_error("indexedDB", e))),
            _ => return done(Err(StorageError::Unavailable("indexedDB not supported".into()))),
        };
        let request = match factory.open_with_u32(&self.db_name, DB_VERSION) {
            Ok(request) => request,
            Err(e) => return done(Err(js_error("open", e))),
        };

        // First open: create the object store
        {
            let opening = request.clone();
            let store_name = self.store_name.clone();
            let closure = Closure::once_into_js(move |_event: web_sys::IdbVersionChangeEvent| {
                let db = opening.result().and_then(|r| r.dyn_into::<IdbDatabase>());
                match db.and_then(|db| db.create_object_store(&store_name)) {
                    Ok(_) => log::info!("Created snapshot object store '{store_name}'"),
                    Err(e) => log::warn!("Cannot create snapshot object store: {e:?}"),
                }
            });
            request.set_onupgradeneeded(Some(closure.unchecked_ref()));
        }

        let done = pending(done);
        {
            let done = done.clone();
            let opening = request.clone();
            let cache = self.db.clone();
            let closure = Closure::once_into_js(move |_event: web_sys::Event| {
                match opening.result().and_then(|r| r.dyn_into::<IdbDatabase>()) {
                    Ok(db) => {
                        *cache.borrow_mut() = Some(db.clone());
                        settle(&done, Ok(db));
                    }
                    Err(e) => settle(&done, Err(js_error("open", e))),
                }
            });
            request.set_onsuccess(Some(closure.unchecked_ref()));
        }
        {
            let closure = Closure::once_into_js(move |_event: web_sys::Event| {
                settle(&done, Err(StorageError::Unavailable("indexedDB open failed".into())));
            });
            request.set_onerror(Some(closure.unchecked_ref()));
        }
    }
}

impl SnapshotStore for IdbSnapshotStore {
    fn save(&self, record: &str, payload: String, done: SaveCallback) {
        let record = record.to_string();
        let store_name = self.store_name.clone();
        let cache = self.db.clone();
        self.with_db(Box::new(move |db| {
            let db = match db {
                Ok(db) => db,
                Err(e) => return done(Err(e)),
            };
            let tx = match db.transaction_with_str_and_mode(&store_name, IdbTransactionMode::Readwrite) {
                Ok(tx) => tx,
                Err(e) => {
                    cache.borrow_mut().take();
                    return done(Err(js_error("transaction", e)));
                }
            };
            let put = tx
                .object_store(&store_name)
                .and_then(|store| store.put_with_key(&JsValue::from_str(&payload), &JsValue::from_str(&record)));
            if let Err(e) = put {
                return done(Err(js_error("put", e)));
            }

            // Durable only once the transaction commits
            let done = pending(done);
            {
                let done = done.clone();
                let closure = Closure::once_into_js(move |_event: web_sys::Event| settle(&done, Ok(())));
                tx.set_oncomplete(Some(closure.unchecked_ref()));
            }
            {
                let done = done.clone();
                let key = record.clone();
                let closure = Closure::once_into_js(move |_event: web_sys::Event| {
                    settle(
                        &done,
                        Err(StorageError::Rejected {
                            key,
                            reason: "transaction error".into(),
                        }),
                    );
                });
                tx.set_onerror(Some(closure.unchecked_ref()));
            }
            {
                let closure = Closure::once_into_js(move |_event: web_sys::Event| {
                    settle(
                        &done,
                        Err(StorageError::Rejected {
                            key: record,
                            reason: "transaction aborted".into(),
                        }),
                    );
                });
                tx.set_onabort(Some(closure.unchecked_ref()));
            }
        }));
    }

    fn load(&self, record: &str, done: LoadCallback) {
        let record = record.to_string();
        let store_name = self.store_name.clone();
        let cache = self.db.clone();
        self.with_db(Box::new(move |db| {
            let db = match db {
                Ok(db) => db,
                Err(e) => return done(Err(e)),
            };
            let request = db
                .transaction_with_str(&store_name)
                .and_then(|tx| tx.object_store(&store_name))
                .and_then(|store| store.get(&JsValue::from_str(&record)));
            let request = match request {
                Ok(request) => request,
                Err(e) => {
                    cache.borrow_mut().take();
                    return done(Err(js_error("get", e)));
                }
            };

            let done = pending(done);
            {
                let done = done.clone();
                let reading = request.clone();
                let closure = Closure::once_into_js(move |_event: web_sys::Event| {
                    // A missing record resolves to `undefined`
                    let result = reading.result().map(|value| value.as_string());
                    settle(&done, result.map_err(|e| js_error("get", e)));
                });
                request.set_onsuccess(Some(closure.unchecked_ref()));
            }
            {
                let closure = Closure::once_into_js(move |_event: web_sys::Event| {
                    settle(&done, Err(StorageError::Unavailable("snapshot read failed".into())));
                });
                request.set_onerror(Some(closure.unchecked_ref()));
            }
        }));
    }
}
