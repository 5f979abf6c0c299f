//! CLI subcommand: `shellfence paths`
//!
//! Prints all resolved XDG-compliant paths for debugging and scripting.

use anyhow::Result;

use crate::paths::Paths;

pub fn run() -> Result<()> {
    let paths = Paths::resolve()?;

    println!("shellfence Paths (XDG Base Directory)");
    println!("=====================================");
    println!();
    println!("Config:     {}", paths.config_dir.display());
    println!("  config.toml:    {}", paths.config_file().display());
    println!();
    println!("State:      {}", paths.state_dir.display());
    println!("  filters:        {}", paths.filters_dir().display());
    println!("  violation log:  {}", paths.violation_log().display());
    println!();
    match paths.runtime_dir {
        Some(ref dir) => println!("Runtime:    {}", dir.display()),
        None => println!("Runtime:    (not available, using state dir)"),
    }
    println!("  apply helper:   {}", paths.helper_link().display());

    Ok(())
}
