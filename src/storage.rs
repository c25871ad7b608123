use anyhow::Result;

use crate::runner::{CommandRunner, CommandSpec, ShellRunner};

/// Object-storage operations needed to provision the artifact bucket.
pub trait ObjectStore {
    fn create_bucket(&self, bucket: &str, region: &str) -> Result<()>;
    fn enable_versioning(&self, bucket: &str, region: &str) -> Result<()>;
}

/// S3 access through the `aws` command line tool, which picks up ambient
/// credentials the same way the rest of the toolchain does.
pub struct AwsCli<R = ShellRunner> {
    runner: R,
    program: String,
}

impl Default for AwsCli<ShellRunner> {
    fn default() -> Self {
        Self::new(ShellRunner)
    }
}

impl<R: CommandRunner> AwsCli<R> {
    pub fn new(runner: R) -> Self {
        Self {
            runner,
            program: "aws".to_string(),
        }
    }

    pub fn with_program(mut self, program: impl Into<String>) -> Self {
        self.program = program.into();
        self
    }

    pub fn create_bucket_command(&self, bucket: &str, region: &str) -> CommandSpec {
        CommandSpec::new(&self.program).args([
            "s3".to_string(),
            "mb".to_string(),
            format!("s3://{bucket}"),
            "--region".to_string(),
            region.to_string(),
        ])
    }

    pub fn versioning_command(&self, bucket: &str, region: &str) -> CommandSpec {
        CommandSpec::new(&self.program).args([
            "s3api",
            "put-bucket-versioning",
            "--bucket",
            bucket,
            "--versioning-configuration",
            "Status=Enabled",
            "--region",
            region,
        ])
    }
}

impl<R: CommandRunner> ObjectStore for AwsCli<R> {
    fn create_bucket(&self, bucket: &str, region: &str) -> Result<()> {
        self.runner
            .run_checked(&self.create_bucket_command(bucket, region))?;
        Ok(())
    }

    fn enable_versioning(&self, bucket: &str, region: &str) -> Result<()> {
        self.runner
            .run_checked(&self.versioning_command(bucket, region))?;
        Ok(())
    }
}
