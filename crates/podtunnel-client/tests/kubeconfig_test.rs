//! Kubeconfig loading from files on disk

use podtunnel_client::{load_kubeconfig, resolve_context, Auth, ConfigError, ResolvedContext};
use std::fs;
use std::path::Path;

async fn resolve(path: &Path, context: Option<&str>) -> Result<ResolvedContext, ConfigError> {
    resolve_context(load_kubeconfig(Some(path))?, context).await
}

const CA_PEM: &str = "-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n";

#[tokio::test]
async fn test_relative_paths_resolve_against_kubeconfig_dir() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("certs")).unwrap();
    fs::write(dir.path().join("certs/ca.crt"), CA_PEM).unwrap();
    fs::write(dir.path().join("token"), "file-token\n").unwrap();

    let path = dir.path().join("config");
    fs::write(
        &path,
        r#"
apiVersion: v1
kind: Config
current-context: staging
clusters:
- name: staging
  cluster:
    server: https://staging.example.com:6443/k8s
    certificate-authority: certs/ca.crt
contexts:
- name: staging
  context:
    cluster: staging
    user: deployer
users:
- name: deployer
  user:
    tokenFile: token
"#,
    )
    .unwrap();

    let resolved = resolve(&path, None).await.unwrap();

    assert_eq!(resolved.namespace, "default");
    assert_eq!(resolved.descriptor.tls.ca_pem.as_deref(), Some(CA_PEM.as_bytes()));
    assert_eq!(resolved.descriptor.auth, Auth::Bearer("file-token".to_string()));
    assert_eq!(
        resolved
            .descriptor
            .endpoint()
            .url_for("/api/v1/namespaces/default/pods/web-0/portforward")
            .as_str(),
        "https://staging.example.com:6443/k8s/api/v1/namespaces/default/pods/web-0/portforward"
    );
}

#[tokio::test]
async fn test_basic_auth_and_insecure_cluster() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config");
    fs::write(
        &path,
        r#"
current-context: lab
clusters:
- name: lab
  cluster:
    server: https://192.168.49.2:8443
    insecure-skip-tls-verify: true
contexts:
- name: lab
  context:
    cluster: lab
    user: admin
    namespace: tools
users:
- name: admin
  user:
    username: admin
    password: s3cret
"#,
    )
    .unwrap();

    let resolved = resolve(&path, Some("lab")).await.unwrap();

    assert_eq!(resolved.namespace, "tools");
    assert!(resolved.descriptor.tls.insecure_skip_verify);
    assert_eq!(
        resolved.descriptor.auth,
        Auth::Basic {
            username: "admin".to_string(),
            password: "s3cret".to_string(),
        }
    );
}

#[tokio::test]
async fn test_missing_referenced_files() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config");
    fs::write(
        &path,
        r#"
current-context: broken
clusters:
- name: broken
  cluster:
    server: https://10.0.0.1:6443
    certificate-authority: missing-ca.crt
- name: reachable
  cluster:
    server: https://10.0.0.2:6443
contexts:
- name: broken
  context:
    cluster: broken
    user: nobody
- name: tokenless
  context:
    cluster: reachable
    user: tokenless
users:
- name: nobody
  user: {}
- name: tokenless
  user:
    tokenFile: missing-token
"#,
    )
    .unwrap();

    assert!(matches!(
        resolve(&path, None).await,
        Err(ConfigError::Kubeconfig(_))
    ));

    match resolve(&path, Some("tokenless")).await {
        Err(ConfigError::Io { path, .. }) => assert!(path.ends_with("missing-token")),
        other => panic!("unexpected result: {:?}", other),
    }
}

#[tokio::test]
async fn test_missing_file_and_bad_yaml() {
    let dir = tempfile::tempdir().unwrap();

    assert!(matches!(
        load_kubeconfig(Some(&dir.path().join("nope"))),
        Err(ConfigError::Kubeconfig(_))
    ));

    let path = dir.path().join("config");
    fs::write(&path, "clusters: [not: a: list").unwrap();
    assert!(matches!(
        load_kubeconfig(Some(&path)),
        Err(ConfigError::Kubeconfig(_))
    ));
}

#[tokio::test]
async fn test_kubeconfig_env_list_is_merged() {
    let dir = tempfile::tempdir().unwrap();
    let first = dir.path().join("first");
    let second = dir.path().join("second");
    fs::write(
        &first,
        r#"
current-context: one
clusters:
- name: one
  cluster:
    server: https://one.example.com
contexts:
- name: one
  context:
    cluster: one
    user: one
users:
- name: one
  user:
    token: first-token
"#,
    )
    .unwrap();
    fs::write(
        &second,
        r#"
clusters:
- name: two
  cluster:
    server: https://two.example.com
contexts:
- name: two
  context:
    cluster: two
    user: two
    namespace: other
users:
- name: two
  user:
    token: second-token
"#,
    )
    .unwrap();

    let joined = std::env::join_paths([&first, &second]).unwrap();
    std::env::set_var("KUBECONFIG", &joined);
    let loaded = load_kubeconfig(None);
    std::env::remove_var("KUBECONFIG");

    let resolved = resolve_context(loaded.unwrap(), Some("two")).await.unwrap();
    assert_eq!(resolved.namespace, "other");
    assert_eq!(resolved.descriptor.auth, Auth::Bearer("second-token".to_string()));
    assert_eq!(resolved.descriptor.server.as_str(), "https://two.example.com/");
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_plugin_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let plugin = dir.path().join("auth-plugin.sh");
    fs::write(
        &plugin,
        "printf '{\"kind\":\"ExecCredential\",\"status\":{\"token\":\"%s-%s\"}}' \"$PLUGIN_PREFIX\" \"$1\"\n",
    )
    .unwrap();

    let path = dir.path().join("config");
    fs::write(
        &path,
        format!(
            r#"
current-context: gke
clusters:
- name: gke
  cluster:
    server: https://34.0.0.1
contexts:
- name: gke
  context:
    cluster: gke
    user: gke
users:
- name: gke
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: sh
      args: ["{}", "cluster-a"]
      env:
      - name: PLUGIN_PREFIX
        value: exec
"#,
            plugin.display()
        ),
    )
    .unwrap();

    let resolved = resolve(&path, None).await.unwrap();
    assert_eq!(
        resolved.descriptor.auth,
        Auth::Bearer("exec-cluster-a".to_string())
    );
}

#[cfg(unix)]
#[tokio::test]
async fn test_exec_plugin_failure_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config");
    fs::write(
        &path,
        r#"
current-context: gke
clusters:
- name: gke
  cluster:
    server: https://34.0.0.1
contexts:
- name: gke
  context:
    cluster: gke
    user: gke
users:
- name: gke
  user:
    exec:
      apiVersion: client.authentication.k8s.io/v1beta1
      command: sh
      args: ["-c", "echo 'not logged in' >&2; exit 1"]
"#,
    )
    .unwrap();

    match resolve(&path, None).await {
        Err(ConfigError::Exec { command, reason }) => {
            assert_eq!(command, "sh");
            assert!(reason.contains("not logged in"), "{}", reason);
        }
        other => panic!("unexpected result: {:?}", other),
    }
}
