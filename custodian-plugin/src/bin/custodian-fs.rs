//! Filesystem store plugin executable.

fn main() {
    custodian_plugin::run(custodian_plugin::builtin::FsStore);
}
