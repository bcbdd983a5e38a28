//! Turns the declarations file into registered bindings.
use std::time::Duration;

use config::{BindConfig, DeclaredType};
use kvbind_core::{prelude::*, tokio::task::JoinHandle};
use tokio_util::sync::CancellationToken;

/// Register every declared binding and leadership flag on `binder`. Each
/// bound slot gets a task logging its updates until `token` is cancelled.
pub async fn register(
    binder: &mut Binder,
    cfg: &BindConfig,
    token: &CancellationToken,
) -> Result<Vec<JoinHandle<()>>> {
    for (name, value) in cfg.dependencies() {
        binder.dependencies().insert(name.clone(), value.clone());
    }

    let mut reporters = Vec::new();
    for decl in cfg.bindings() {
        let subscribe = SubscribeType::from(decl.subscribe);
        let strategy = CreateStrategy::from(decl.create);
        macro_rules! value {
            ($ty:ty) => {{
                let slot = BoundValue::<$ty>::new();
                binder
                    .register_value_binding(
                        &decl.path,
                        &decl.name,
                        slot.clone(),
                        subscribe,
                        strategy,
                        decl.initial,
                    )
                    .await?;
                reporters.push(report(decl.name.clone(), slot, token.clone()));
            }};
        }
        match decl.ty {
            DeclaredType::String => value!(String),
            DeclaredType::Integer => value!(i64),
            DeclaredType::Unsigned => value!(u64),
            DeclaredType::Float => value!(f64),
            DeclaredType::Bool => value!(bool),
            DeclaredType::Duration => value!(Duration),
            DeclaredType::Callback => {
                let name = decl.name.clone();
                binder
                    .register_invoker_binding(
                        &decl.path,
                        &decl.name,
                        move |raw: &str| {
                            info!(binding = %name, value = raw, "callback invoked");
                            Ok(())
                        },
                        subscribe,
                        strategy,
                        decl.initial,
                    )
                    .await?;
            }
        }
        debug!(path = %decl.path, name = %decl.name, ty = ?decl.ty, "registered binding");
    }

    for decl in cfg.leaders() {
        let flag = BoundValue::new();
        binder.register_leadership_binding(&decl.path, LeaderTarget::flag(flag.clone()))?;
        reporters.push(report(decl.name.clone(), flag, token.clone()));
        debug!(path = %decl.path, name = %decl.name, "registered leadership flag");
    }
    Ok(reporters)
}

fn report<T: Bindable>(
    name: String,
    slot: BoundValue<T>,
    token: CancellationToken,
) -> JoinHandle<()> {
    let mut rx = slot.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    let value = rx.borrow_and_update().clone();
                    info!(binding = %name, ?value, "binding updated");
                }
            }
        }
    })
}
