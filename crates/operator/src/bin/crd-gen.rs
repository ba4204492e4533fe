use composite_operator::CompositeApp;
use kube::CustomResourceExt;

fn main() -> anyhow::Result<()> {
    print!("{}", serde_yaml::to_string(&CompositeApp::crd())?);
    Ok(())
}
