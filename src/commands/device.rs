use eyre::Result;

use insidr::config::Config;
use insidr::identity;
use insidr::storage::FileStore;

pub fn run(config: &Config) -> Result<()> {
    let store = FileStore::new(Config::expand_path(&config.storage_dir));
    println!("{}", identity::device_id(&store));
    Ok(())
}
