pub mod password;
pub mod provisioner;
pub mod state;

pub use self::password::generate_password;
pub use self::provisioner::{
    ExecutorFactory, PgBouncerOverrides, Provisioner, TenantConnectionFactory,
};
pub use self::state::ProvisioningState;
