//! Elastic Beanstalk user-data patching.
//!
//! Beanstalk platform-init scripts call the CloudFormation helpers with
//! static credentials baked into the user-data at group creation time.
//! Those credentials are scoped to the original launch descriptor and stop
//! working on instances we launch ourselves, so the helpers have to
//! authenticate with the instance role instead.

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::debug;

/// Marker identifying a Beanstalk platform-init script.
const BEANSTALK_MARKER: &str = "/opt/elasticbeanstalk";

/// Authentication arguments Beanstalk bakes into its cfn helper calls.
const CFN_KEY_AUTH_ARGS: &str = "--access-key ${CFN_ACCESS_KEY} --secret-key ${CFN_SECRET_KEY}";

/// Replacement that makes the helpers authenticate with the instance role.
const CFN_ROLE_AUTH_ARGS: &str = "--role ${EB_INSTANCE_ROLE}";

/// Rewrites a base64 user-data blob so CloudFormation helper invocations use
/// the instance role. Anything that is not a Beanstalk platform-init script
/// passes through unchanged, as does user-data that fails to decode.
pub fn patch_beanstalk_user_data(user_data_b64: &str) -> String {
    let decoded = match BASE64.decode(user_data_b64) {
        Ok(bytes) => match String::from_utf8(bytes) {
            Ok(script) => script,
            Err(_) => return user_data_b64.to_string(),
        },
        Err(_) => return user_data_b64.to_string(),
    };

    if !decoded.contains(BEANSTALK_MARKER) || !decoded.contains(CFN_KEY_AUTH_ARGS) {
        return user_data_b64.to_string();
    }

    debug!("Patching Beanstalk user-data to authenticate with the instance role");
    let patched = decoded.replace(CFN_KEY_AUTH_ARGS, CFN_ROLE_AUTH_ARGS);
    BASE64.encode(patched)
}
