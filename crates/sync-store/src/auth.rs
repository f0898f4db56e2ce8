use tokio::sync::watch;

/// Session presence seam: `Some(user_id)` while signed in.
///
/// Every per-session component is gated on this value; a change to `None` or
/// to a different user tears the running session down.
#[derive(Debug, Clone)]
pub struct AuthSession {
    tx: watch::Sender<Option<String>>,
}

impl Default for AuthSession {
    fn default() -> Self {
        let (tx, _) = watch::channel(None);
        Self { tx }
    }
}

impl AuthSession {
    pub fn current_user(&self) -> Option<String> {
        self.tx.borrow().clone()
    }

    pub fn sign_in(&self, user_id: impl Into<String>) {
        let user_id = user_id.into();
        self.tx.send_if_modified(|current| {
            if current.as_deref() == Some(user_id.as_str()) {
                return false;
            }
            *current = Some(user_id);
            true
        });
    }

    pub fn sign_out(&self) {
        self.tx.send_if_modified(|current| current.take().is_some());
    }

    pub fn watch(&self) -> watch::Receiver<Option<String>> {
        self.tx.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watchers_see_sign_in_and_out() {
        let auth = AuthSession::default();
        let mut rx = auth.watch();
        assert_eq!(*rx.borrow(), None);

        auth.sign_in("u-1");
        rx.changed().await.expect("sender alive");
        assert_eq!(rx.borrow_and_update().as_deref(), Some("u-1"));

        auth.sign_out();
        rx.changed().await.expect("sender alive");
        assert_eq!(*rx.borrow_and_update(), None);
        assert_eq!(auth.current_user(), None);
    }

    #[test]
    fn repeated_sign_in_does_not_notify() {
        let auth = AuthSession::default();
        let mut rx = auth.watch();
        auth.sign_in("u-1");
        let _ = rx.borrow_and_update();
        auth.sign_in("u-1");
        assert!(!rx.has_changed().expect("sender alive"));
    }
}
