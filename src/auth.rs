use async_trait::async_trait;

/// Decides whether a hello handshake may open a tenant.
#[async_trait]
pub trait AuthSource: Send + Sync {
    async fn authenticate(&self, tenant: &str, password: &str) -> bool;
}

/// One shared password for every tenant.
#[derive(Debug)]
pub struct SharedPasswordAuth {
    password: String,
}

impl SharedPasswordAuth {
    pub fn new(password: String) -> Self {
        Self { password }
    }
}

#[async_trait]
impl AuthSource for SharedPasswordAuth {
    async fn authenticate(&self, _tenant: &str, password: &str) -> bool {
        constant_time_eq(self.password.as_bytes(), password.as_bytes())
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn accepts_only_the_password() {
        let auth = SharedPasswordAuth::new("s3cret".into());
        assert!(auth.authenticate("shop", "s3cret").await);
        assert!(!auth.authenticate("shop", "s3cre").await);
        assert!(!auth.authenticate("shop", "S3cret").await);
        assert!(!auth.authenticate("shop", "").await);
    }
}
