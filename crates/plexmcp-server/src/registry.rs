//! Primitive registries: tools, prompts, resources, resource templates.
//!
//! Each registry keys entries by their current name while identity lives in
//! the entry allocation itself, so an entry survives renames and updates.
//! Every mutation marks the registry dirty; a burst of synchronous
//! mutations coalesces into a single `list_changed` notification.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};

use serde_json::{Map, Value};
use tracing::debug;

use plexmcp_protocol::engine::RequestContext;
use plexmcp_protocol::error::{Error, Result};
use plexmcp_protocol::types::{
    CallToolResult, GetPromptResult, Icon, Prompt, PromptArgument, ReadResourceResult, Resource,
    ResourceTemplate, Tool,
};

use crate::uri_template::UriTemplate;

/// Boxed handler future
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = Result<T>> + Send>>;

/// Tool invocation callback
pub type ToolCallback =
    Arc<dyn Fn(Map<String, Value>, RequestContext) -> BoxFuture<CallToolResult> + Send + Sync>;

/// Prompt rendering callback
pub type PromptCallback = Arc<
    dyn Fn(HashMap<String, Value>, RequestContext) -> BoxFuture<GetPromptResult> + Send + Sync,
>;

/// Resource read callback; receives the concrete URI
pub type ResourceCallback =
    Arc<dyn Fn(String, RequestContext) -> BoxFuture<ReadResourceResult> + Send + Sync>;

/// Template read callback; receives the concrete URI and matched variables
pub type TemplateCallback = Arc<
    dyn Fn(String, HashMap<String, String>, RequestContext) -> BoxFuture<ReadResourceResult>
        + Send
        + Sync,
>;

/// Common registration surface every registered primitive shares
pub trait RegistryEntry: Send + Sync + 'static {
    /// Current programmatic name
    fn name(&self) -> String;
    /// Rename in place
    fn set_name(&mut self, name: String);
    /// Whether the entry is currently listed and callable
    fn enabled(&self) -> bool;
    /// Flip availability
    fn set_enabled(&mut self, enabled: bool);
}

macro_rules! impl_registry_entry {
    ($ty:ty) => {
        impl RegistryEntry for $ty {
            fn name(&self) -> String {
                self.name.clone()
            }
            fn set_name(&mut self, name: String) {
                self.name = name;
            }
            fn enabled(&self) -> bool {
                self.enabled
            }
            fn set_enabled(&mut self, enabled: bool) {
                self.enabled = enabled;
            }
        }
    };
}

/// A registered tool
#[derive(Clone)]
pub struct ToolEntry {
    /// Current name
    pub name: String,
    /// Display title
    pub title: Option<String>,
    /// Description
    pub description: Option<String>,
    /// JSON Schema for arguments
    pub input_schema: Value,
    /// JSON Schema for structured output
    pub output_schema: Option<Value>,
    /// Icons
    pub icons: Option<Vec<Icon>>,
    /// Whether the tool is listed and callable
    pub enabled: bool,
    /// Whether `tools/call` may be task-augmented for this tool
    pub supports_tasks: bool,
    /// Invocation callback
    pub callback: ToolCallback,
}

impl_registry_entry!(ToolEntry);

impl ToolEntry {
    /// Project into the wire `Tool` shape
    pub fn to_wire(&self) -> Tool {
        Tool {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            input_schema: self.input_schema.clone(),
            output_schema: self.output_schema.clone(),
            icons: self.icons.clone(),
        }
    }
}

/// Declared prompt argument: the object-shape side of the wire projection
#[derive(Debug, Clone)]
pub struct PromptArgDef {
    /// Argument name
    pub name: String,
    /// Argument description
    pub description: Option<String>,
    /// Whether the argument is required (`required = !optional`)
    pub required: bool,
}

/// A registered prompt
#[derive(Clone)]
pub struct PromptEntry {
    /// Current name
    pub name: String,
    /// Display title
    pub title: Option<String>,
    /// Description
    pub description: Option<String>,
    /// Declared arguments
    pub arguments: Vec<PromptArgDef>,
    /// Icons
    pub icons: Option<Vec<Icon>>,
    /// Whether the prompt is listed and retrievable
    pub enabled: bool,
    /// Rendering callback
    pub callback: PromptCallback,
}

impl_registry_entry!(PromptEntry);

impl PromptEntry {
    /// Project into the wire `Prompt` shape, including the
    /// `arguments: [{name, description, required}]` projection.
    pub fn to_wire(&self) -> Prompt {
        let arguments = (!self.arguments.is_empty()).then(|| {
            self.arguments
                .iter()
                .map(|a| PromptArgument {
                    name: a.name.clone(),
                    description: a.description.clone(),
                    required: Some(a.required),
                })
                .collect()
        });
        Prompt {
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            arguments,
            icons: self.icons.clone(),
        }
    }
}

/// A registered concrete resource
#[derive(Clone)]
pub struct ResourceEntry {
    /// Current name
    pub name: String,
    /// Resource URI
    pub uri: String,
    /// Display title
    pub title: Option<String>,
    /// Description
    pub description: Option<String>,
    /// MIME type
    pub mime_type: Option<String>,
    /// Icons
    pub icons: Option<Vec<Icon>>,
    /// Whether the resource is listed and readable
    pub enabled: bool,
    /// Read callback
    pub callback: ResourceCallback,
}

impl_registry_entry!(ResourceEntry);

impl ResourceEntry {
    /// Project into the wire `Resource` shape
    pub fn to_wire(&self) -> Resource {
        Resource {
            uri: self.uri.clone(),
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
            icons: self.icons.clone(),
        }
    }
}

/// A registered resource template
#[derive(Clone)]
pub struct TemplateEntry {
    /// Current name
    pub name: String,
    /// Parsed URI template
    pub template: UriTemplate,
    /// Display title
    pub title: Option<String>,
    /// Description
    pub description: Option<String>,
    /// MIME type of produced resources
    pub mime_type: Option<String>,
    /// Whether the template is listed and matchable
    pub enabled: bool,
    /// Read callback
    pub callback: TemplateCallback,
}

impl_registry_entry!(TemplateEntry);

impl TemplateEntry {
    /// Project into the wire `ResourceTemplate` shape
    pub fn to_wire(&self) -> ResourceTemplate {
        ResourceTemplate {
            uri_template: self.template.as_str().to_string(),
            name: self.name.clone(),
            title: self.title.clone(),
            description: self.description.clone(),
            mime_type: self.mime_type.clone(),
        }
    }
}

type ChangedCallback = Arc<dyn Fn() + Send + Sync>;

struct RegistryInner<T> {
    entries: StdRwLock<Vec<Arc<StdRwLock<T>>>>,
    on_changed: StdMutex<Option<ChangedCallback>>,
    dirty: AtomicBool,
}

/// A keyed store of primitives with stable identity across renames.
pub struct Registry<T: RegistryEntry> {
    inner: Arc<RegistryInner<T>>,
}

impl<T: RegistryEntry> Clone for Registry<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: RegistryEntry> Default for Registry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: RegistryEntry> Registry<T> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                entries: StdRwLock::new(Vec::new()),
                on_changed: StdMutex::new(None),
                dirty: AtomicBool::new(false),
            }),
        }
    }

    /// Install the callback behind coalesced `list_changed` notifications
    pub fn on_list_changed<F: Fn() + Send + Sync + 'static>(&self, f: F) {
        *self
            .inner
            .on_changed
            .lock()
            .expect("callback lock poisoned") = Some(Arc::new(f));
    }

    /// Register an entry, rejecting duplicate names
    pub fn register(&self, entry: T) -> Result<RegistryHandle<T>> {
        let name = entry.name();
        let mut entries = self.inner.entries.write().expect("registry lock poisoned");
        if entries
            .iter()
            .any(|e| e.read().expect("entry lock poisoned").name() == name)
        {
            return Err(Error::invalid_params(format!("{name} is already registered")));
        }
        let entry = Arc::new(StdRwLock::new(entry));
        entries.push(entry.clone());
        drop(entries);
        self.mark_changed();
        Ok(RegistryHandle {
            registry: self.clone(),
            entry,
        })
    }

    /// Look up an enabled entry by name
    pub fn get_enabled(&self, name: &str) -> Option<Arc<StdRwLock<T>>> {
        self.inner
            .entries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .find(|e| {
                let entry = e.read().expect("entry lock poisoned");
                entry.name() == name && entry.enabled()
            })
            .cloned()
    }

    /// Whether any entry (enabled or not) has this name
    pub fn contains(&self, name: &str) -> bool {
        self.inner
            .entries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .any(|e| e.read().expect("entry lock poisoned").name() == name)
    }

    /// Snapshot of enabled entries, sorted by name
    pub fn list_enabled(&self) -> Vec<T>
    where
        T: Clone,
    {
        let mut entries: Vec<T> = self
            .inner
            .entries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|e| e.read().expect("entry lock poisoned").clone())
            .filter(RegistryEntry::enabled)
            .collect();
        entries.sort_by_key(RegistryEntry::name);
        entries
    }

    /// Visit every entry, enabled or not
    pub fn for_each<F: FnMut(&T)>(&self, mut f: F) {
        for entry in self
            .inner
            .entries
            .read()
            .expect("registry lock poisoned")
            .iter()
        {
            f(&entry.read().expect("entry lock poisoned"));
        }
    }

    fn remove_entry(&self, entry: &Arc<StdRwLock<T>>) {
        self.inner
            .entries
            .write()
            .expect("registry lock poisoned")
            .retain(|e| !Arc::ptr_eq(e, entry));
        self.mark_changed();
    }

    /// Mark the registry dirty and schedule one notification for the burst.
    fn mark_changed(&self) {
        if self.inner.dirty.swap(true, Ordering::SeqCst) {
            return;
        }
        let inner = self.inner.clone();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    // Let the current burst of synchronous mutations finish.
                    tokio::task::yield_now().await;
                    inner.dirty.store(false, Ordering::SeqCst);
                    let callback = inner
                        .on_changed
                        .lock()
                        .expect("callback lock poisoned")
                        .clone();
                    if let Some(callback) = callback {
                        callback();
                    }
                });
            }
            // Outside a runtime (startup registration) there is no peer to
            // notify yet.
            Err(_) => {
                self.inner.dirty.store(false, Ordering::SeqCst);
            }
        }
    }
}

/// Handle to a registered entry; identity is stable across renames.
pub struct RegistryHandle<T: RegistryEntry> {
    registry: Registry<T>,
    entry: Arc<StdRwLock<T>>,
}

impl<T: RegistryEntry> Clone for RegistryHandle<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            entry: self.entry.clone(),
        }
    }
}

impl<T: RegistryEntry> RegistryHandle<T> {
    /// Current name
    pub fn name(&self) -> String {
        self.entry.read().expect("entry lock poisoned").name()
    }

    /// Whether the entry is currently enabled
    pub fn is_enabled(&self) -> bool {
        self.entry.read().expect("entry lock poisoned").enabled()
    }

    /// List the entry again
    pub fn enable(&self) {
        self.set_enabled(true);
    }

    /// Hide the entry from listing and invocation
    pub fn disable(&self) {
        self.set_enabled(false);
    }

    fn set_enabled(&self, enabled: bool) {
        let changed = {
            let mut entry = self.entry.write().expect("entry lock poisoned");
            let changed = entry.enabled() != enabled;
            entry.set_enabled(enabled);
            changed
        };
        if changed {
            self.registry.mark_changed();
        }
    }

    /// Rename the entry; the destination name must be free
    pub fn rename(&self, new_name: impl Into<String>) -> Result<()> {
        let new_name = new_name.into();
        if self.name() == new_name {
            return Ok(());
        }
        if self.registry.contains(&new_name) {
            return Err(Error::invalid_params(format!(
                "{new_name} is already registered"
            )));
        }
        debug!(from = %self.name(), to = %new_name, "renaming registry entry");
        self.entry
            .write()
            .expect("entry lock poisoned")
            .set_name(new_name);
        self.registry.mark_changed();
        Ok(())
    }

    /// Apply an arbitrary update to the entry
    pub fn update<F: FnOnce(&mut T)>(&self, f: F) {
        f(&mut self.entry.write().expect("entry lock poisoned"));
        self.registry.mark_changed();
    }

    /// Remove the entry from the registry
    pub fn remove(&self) {
        self.registry.remove_entry(&self.entry);
    }
}
